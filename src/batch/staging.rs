//! Staged output files committed by rename.
//!
//! The staging file always lives next to the final path, so the commit is a
//! same-filesystem rename. There is no copy-then-delete fallback: a rename
//! that fails leaves the final path untouched and reports an error.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, warn};

const STAGING_MARKER: &str = ".partial-";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("{}", describe_io("cannot create output directory", path, source))]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}", describe_io("cannot stage output in", path, source))]
    Reserve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("staged output for {} is missing after the tool finished", path.display())]
    Missing { path: PathBuf },
    #[error("staged output for {} is empty", path.display())]
    Empty { path: PathBuf },
    #[error("{}", describe_io("cannot commit staged output to", path, source))]
    Commit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    /// Errors raised after the tool ran mean the rename guard refused a commit.
    pub fn is_write_guard(&self) -> bool {
        matches!(
            self,
            Self::Missing { .. } | Self::Empty { .. } | Self::Commit { .. }
        )
    }
}

fn describe_io(action: &str, path: &Path, source: &io::Error) -> String {
    let label = match source.kind() {
        io::ErrorKind::PermissionDenied => "PermissionError",
        io::ErrorKind::NotFound => "FileNotFoundError",
        _ => "OSError",
    };
    format!("{label}: {action} {}: {source}", path.display())
}

pub fn is_staging_file_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGING_MARKER)
}

/// Reserves the staging file for a job's output.
pub trait OutputStager: Send + Sync + 'static {
    fn stage(&self, final_path: &Path) -> Result<StagedOutput, StagingError>;
}

/// Stages next to the final path.
#[derive(Debug, Default, Clone)]
pub struct SiblingTempStager;

impl OutputStager for SiblingTempStager {
    fn stage(&self, final_path: &Path) -> Result<StagedOutput, StagingError> {
        StagedOutput::create(final_path)
    }
}

/// A reserved temp file that either becomes `final_path` or disappears.
///
/// Output directories created for the reservation are removed again when the
/// output is discarded or refused, as long as they are still empty.
#[derive(Debug)]
pub struct StagedOutput {
    temp: TempPath,
    final_path: PathBuf,
    staging_dir: PathBuf,
    created_root: Option<PathBuf>,
}

impl StagedOutput {
    pub fn create(final_path: &Path) -> Result<Self, StagingError> {
        let dir = match final_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let created_root = first_missing_ancestor(dir.as_path());
        fs::create_dir_all(dir.as_path()).map_err(|source| StagingError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let mut prefix = OsString::from(".");
        prefix.push(final_path.file_stem().unwrap_or(OsStr::new("output")));
        prefix.push(STAGING_MARKER);
        let mut suffix = OsString::new();
        if let Some(ext) = final_path.extension() {
            suffix.push(".");
            suffix.push(ext);
        }

        let reserve = || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(&suffix)
                .rand_bytes(8)
                .tempfile_in(dir.as_path())
        };
        // A sibling job may have just removed the directory it created.
        let reserved = match reserve() {
            Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir.as_path())
                .and_then(|()| reserve()),
            other => other,
        };
        let temp = match reserved {
            Ok(file) => file.into_temp_path(),
            Err(source) => {
                remove_created_dirs(dir.as_path(), created_root.as_deref());
                return Err(StagingError::Reserve { path: dir, source });
            }
        };

        debug!(staged = %temp.display(), target = %final_path.display(), "reserved staging file");
        Ok(Self {
            temp,
            final_path: final_path.to_path_buf(),
            staging_dir: dir,
            created_root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn final_path(&self) -> &Path {
        self.final_path.as_path()
    }

    pub fn commit(self) -> Result<PathBuf, StagingError> {
        let Self {
            temp,
            final_path,
            staging_dir,
            created_root,
        } = self;
        let refuse = |temp: TempPath, err: StagingError| -> Result<PathBuf, StagingError> {
            drop(temp);
            remove_created_dirs(staging_dir.as_path(), created_root.as_deref());
            Err(err)
        };

        match fs::metadata(&*temp) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(meta) if meta.is_file() => {
                return refuse(temp, StagingError::Empty { path: final_path });
            }
            _ => return refuse(temp, StagingError::Missing { path: final_path }),
        }

        match temp.persist(final_path.as_path()) {
            Ok(()) => Ok(final_path),
            Err(err) => refuse(
                err.path,
                StagingError::Commit {
                    path: final_path,
                    source: err.error,
                },
            ),
        }
    }

    pub fn discard(self) {
        let Self {
            temp,
            staging_dir,
            created_root,
            ..
        } = self;
        let staged = temp.to_path_buf();
        if let Err(error) = temp.close() {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(staged = %staged.display(), %error, "failed to remove staging file");
            }
        }
        remove_created_dirs(staging_dir.as_path(), created_root.as_deref());
    }
}

fn first_missing_ancestor(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .last()
        .map(Path::to_path_buf)
}

/// Removes `dir` and its parents up to `root`, stopping at the first one that
/// is not empty.
fn remove_created_dirs(dir: &Path, root: Option<&Path>) {
    let Some(root) = root else {
        return;
    };
    for current in dir.ancestors() {
        if fs::remove_dir(current).is_err() || current == root {
            break;
        }
    }
}
