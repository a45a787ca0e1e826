use std::collections::{BTreeSet, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::debug;

use crate::batch::command::CommandTemplate;
use crate::batch::glob::{is_recursive_pattern, name_matches, path_matches};
use crate::batch::staging::is_staging_file_name;
use crate::batch::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSelection {
    pub directory: PathBuf,
    pub pattern: String,
    pub extensions: Vec<String>,
    pub recursive: bool,
}

impl InputSelection {
    pub fn new(directory: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            pattern: pattern.into(),
            extensions: Vec::new(),
            recursive: false,
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("input directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("input path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("no input files in {} match '{pattern}'", directory.display())]
    NoMatches { directory: PathBuf, pattern: String },
    #[error("failed to read input directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid output naming pattern '{0}'")]
    InvalidNamingPattern(String),
    #[error("input {} is outside the input directory", .0.display())]
    OutsideInputDirectory(PathBuf),
    #[error("jobs {first} and {second} both write {}", path.display())]
    OutputCollision {
        first: JobId,
        second: JobId,
        path: PathBuf,
    },
}

/// Resolves the selection into a sorted, duplicate-free list of input files.
pub fn enumerate_inputs(selection: &InputSelection) -> Result<Vec<PathBuf>, EnumerateError> {
    let root = selection.directory.as_path();
    let meta = fs::metadata(root)
        .map_err(|_| EnumerateError::DirectoryNotFound(root.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(EnumerateError::NotADirectory(root.to_path_buf()));
    }

    let pattern = selection.pattern.trim();
    let pattern = if pattern.is_empty() { "*" } else { pattern };
    let descend = selection.recursive || is_recursive_pattern(pattern);
    let allowed = normalized_extensions(selection.extensions.as_slice());

    let mut candidates = Vec::new();
    collect_files(root, descend, &mut candidates)?;

    let mut found = BTreeSet::new();
    for file in candidates {
        let Ok(rel) = file.strip_prefix(root) else {
            continue;
        };
        // Non-UTF-8 names are matched on their lossy form but kept as-is.
        let Some(name) = file.file_name().map(|v| v.to_string_lossy()) else {
            continue;
        };
        let name: &str = name.as_ref();
        if is_staging_file_name(name) {
            continue;
        }
        if !extension_allowed(file.as_path(), &allowed) {
            continue;
        }
        let rel_display = relative_slash_path(rel);
        let matched = if pattern.contains('/') {
            path_matches(pattern, rel_display.as_str())
        } else {
            name_matches(pattern, name)
        };
        if matched {
            found.insert(file);
        }
    }

    if found.is_empty() {
        return Err(EnumerateError::NoMatches {
            directory: root.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }
    debug!(
        directory = %root.display(),
        pattern,
        matched = found.len(),
        "enumerated batch inputs"
    );
    Ok(found.into_iter().collect())
}

fn collect_files(dir: &Path, descend: bool, out: &mut Vec<PathBuf>) -> Result<(), EnumerateError> {
    let entries = fs::read_dir(dir).map_err(|source| EnumerateError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| EnumerateError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if descend {
                collect_files(path.as_path(), descend, out)?;
            }
        } else if fs::metadata(path.as_path())
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

fn normalized_extensions(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn extension_allowed(path: &Path, allowed: &HashSet<String>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|v| v.to_str())
        .map(|v| allowed.contains(v.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative_slash_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputNaming {
    #[default]
    KeepName,
    ChangeExtension(String),
    Pattern(String),
}

impl OutputNaming {
    pub fn file_name(&self, input: &Path, index: JobId) -> Result<OsString, EnumerateError> {
        let stem = input.file_stem().unwrap_or(OsStr::new("file"));
        let ext = input.extension().unwrap_or_default();
        match self {
            Self::KeepName => Ok(input
                .file_name()
                .map(OsStr::to_os_string)
                .unwrap_or_else(|| stem.to_os_string())),
            Self::ChangeExtension(target) => {
                let target = target.trim().trim_start_matches('.');
                if target.is_empty() {
                    return Err(EnumerateError::InvalidNamingPattern(target.to_string()));
                }
                let mut name = stem.to_os_string();
                name.push(".");
                name.push(target);
                Ok(name)
            }
            Self::Pattern(pattern) => {
                let mut name = render_name_pattern(pattern.as_str(), stem, ext, index)?;
                if !ext.is_empty() && !pattern.contains("{ext}") {
                    name.push(".");
                    name.push(ext);
                }
                Ok(name)
            }
        }
    }
}

const MAX_INDEX_WIDTH: usize = 32;

fn render_name_pattern(
    pattern: &str,
    stem: &OsStr,
    ext: &OsStr,
    index: JobId,
) -> Result<OsString, EnumerateError> {
    let invalid = || EnumerateError::InvalidNamingPattern(pattern.to_string());
    let mut out = OsString::with_capacity(pattern.len() + stem.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(invalid)?;
        let token = &after[..close];
        match token {
            "name" => out.push(stem),
            "ext" => out.push(ext),
            "index" => out.push(index.to_string()),
            "date" => out.push(Local::now().format("%Y%m%d").to_string()),
            other => {
                let width = other
                    .strip_prefix("index:0")
                    .and_then(|w| w.strip_suffix('d').or(Some(w)))
                    .and_then(|w| w.parse::<usize>().ok())
                    .filter(|w| *w <= MAX_INDEX_WIDTH)
                    .ok_or_else(invalid)?;
                out.push(format!("{index:0width$}"));
            }
        }
        rest = &after[close + 1..];
    }
    out.push(rest);

    let unsafe_name = {
        let text = out.to_string_lossy();
        text.is_empty() || text.contains('/') || text.contains('\\') || text == "." || text == ".."
    };
    if unsafe_name {
        return Err(invalid());
    }
    Ok(out)
}

/// Turns enumerated inputs into jobs numbered from 1 in submission order.
pub fn plan_jobs(
    inputs: &[PathBuf],
    input_dir: &Path,
    output_dir: &Path,
    naming: &OutputNaming,
    command: &CommandTemplate,
) -> Result<Vec<Job>, EnumerateError> {
    let mut seen = std::collections::HashMap::<PathBuf, JobId>::new();
    let mut jobs = Vec::with_capacity(inputs.len());
    for (offset, input) in inputs.iter().enumerate() {
        let id = offset as JobId + 1;
        let rel = input
            .strip_prefix(input_dir)
            .map_err(|_| EnumerateError::OutsideInputDirectory(input.clone()))?;
        let file_name = naming.file_name(input.as_path(), id)?;
        let output_path = match rel.parent() {
            Some(parent) => output_dir.join(parent).join(file_name),
            None => output_dir.join(file_name),
        };
        if let Some(first) = seen.insert(output_path.clone(), id) {
            return Err(EnumerateError::OutputCollision {
                first,
                second: id,
                path: output_path,
            });
        }
        jobs.push(Job::new(id, input.clone(), output_path, command.clone()));
    }
    Ok(jobs)
}
