//! Caller-owned cache of completed jobs.
//!
//! A hit means the same program already produced this job's output from an
//! unchanged input, and that output is still on disk with the recorded size.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::batch::{BatchError, Job};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns `None` when the input cannot be stat'ed; such jobs are never cached.
    pub fn for_job(program: &Path, job: &Job) -> Option<Self> {
        let meta = fs::metadata(job.input_path.as_path()).ok()?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(program.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        for arg in job
            .command
            .render(job.input_path.as_path(), job.output_path.as_path())
        {
            hasher.update(arg.as_encoded_bytes());
            hasher.update([0u8]);
        }
        hasher.update(meta.len().to_le_bytes());
        hasher.update(modified.to_le_bytes());
        Some(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedOutput {
    path: PathBuf,
    len: u64,
}

#[derive(Debug, Clone)]
pub struct JobCache {
    entries: Arc<Mutex<LruCache<CacheKey, CachedOutput>>>,
}

impl JobCache {
    pub fn new(capacity: usize) -> Result<Self, BatchError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            BatchError::InvalidConfig(String::from("cache capacity must be at least 1"))
        })?;
        Ok(Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    pub fn is_fresh(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock();
        let Some(cached) = entries.get(key) else {
            return false;
        };
        let still_there = fs::metadata(cached.path.as_path())
            .map(|m| m.is_file() && m.len() == cached.len)
            .unwrap_or(false);
        if !still_there {
            debug!(key = key.as_str(), "cached output changed, evicting");
            entries.pop(key);
        }
        still_there
    }

    pub fn record(&self, key: CacheKey, output_path: &Path) {
        let Ok(meta) = fs::metadata(output_path) else {
            return;
        };
        self.entries.lock().put(
            key,
            CachedOutput {
                path: output_path.to_path_buf(),
                len: meta.len(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
