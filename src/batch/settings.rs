use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::batch::process::SuccessPolicy;

pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const MAX_WORKERS_LIMIT: usize = 64;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2000;
pub const DEFAULT_MAX_INPUT_MB: u64 = 100;
pub const ENV_PREFIX: &str = "INKBATCH_";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchSettingsOverlay {
    pub executable: Option<String>,
    pub max_workers: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub pattern: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub recursive: Option<bool>,
    pub overwrite: Option<bool>,
    pub max_input_mb: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub working_dir: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub success: Option<SuccessPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSettings {
    pub executable: Option<PathBuf>,
    pub max_workers: usize,
    pub timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub pattern: String,
    pub extensions: Vec<String>,
    pub recursive: bool,
    pub overwrite: bool,
    pub max_input_mb: u64,
    /// Zero disables the job cache.
    pub cache_capacity: usize,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub success: SuccessPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            executable: None,
            max_workers: DEFAULT_MAX_WORKERS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            pattern: String::from("*"),
            extensions: Vec::new(),
            recursive: false,
            overwrite: false,
            max_input_mb: DEFAULT_MAX_INPUT_MB,
            cache_capacity: 0,
            working_dir: None,
            env: BTreeMap::new(),
            success: SuccessPolicy::default(),
        }
    }
}

impl BatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn max_input_bytes(&self) -> u64 {
        self.max_input_mb.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(1..=MAX_WORKERS_LIMIT).contains(&self.max_workers) {
            return Err(SettingsError::OutOfRange {
                field: String::from("max_workers"),
                message: format!("must be between 1 and {MAX_WORKERS_LIMIT}"),
            });
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(SettingsError::OutOfRange {
                field: String::from("timeout_secs"),
                message: format!("must be between 1 and {MAX_TIMEOUT_SECS}"),
            });
        }
        if self.max_input_mb == 0 {
            return Err(SettingsError::OutOfRange {
                field: String::from("max_input_mb"),
                message: String::from("must be at least 1"),
            });
        }
        if self
            .executable
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(SettingsError::InvalidFieldType {
                field: String::from("executable"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read batch settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse batch settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse batch settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("batch settings root must be a table")]
    RootMustBeObject,
    #[error("batch settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: String, value: String },
    #[error("batch settings field '{field}' {message}")]
    OutOfRange { field: String, message: String },
}

/// Loads `config/batch.settings.toml` under `app_root`, or `explicit_path` when given.
/// A missing file yields an empty overlay.
pub fn load_settings_file(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<BatchSettingsOverlay, SettingsError> {
    let path = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
        .unwrap_or_else(|| app_root.join("config/batch.settings.toml"));

    if !path.exists() {
        return Ok(BatchSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path.as_path()).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;

    let is_json = path
        .extension()
        .and_then(|v| v.to_str())
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));
    let value = if is_json {
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| SettingsError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        })?
    } else {
        let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
            SettingsError::ParseToml {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?;
        serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?
    };
    parse_settings_overlay(&value)
}

pub fn parse_settings_overlay(value: &Value) -> Result<BatchSettingsOverlay, SettingsError> {
    let root = value.as_object().ok_or(SettingsError::RootMustBeObject)?;
    let batch = root
        .get("batch")
        .unwrap_or(value)
        .as_object()
        .ok_or(SettingsError::RootMustBeObject)?;

    let mut out = BatchSettingsOverlay::default();
    if let Some(v) = batch.get("executable") {
        out.executable = Some(parse_string(v, "executable")?);
    }
    if let Some(v) = batch.get("max_workers") {
        out.max_workers = Some(parse_u64(v, "max_workers")? as usize);
    }
    if let Some(v) = batch.get("timeout_secs") {
        out.timeout_secs = Some(parse_u64(v, "timeout_secs")?);
    }
    if let Some(v) = batch.get("kill_grace_ms") {
        out.kill_grace_ms = Some(parse_u64(v, "kill_grace_ms")?);
    }
    if let Some(v) = batch.get("pattern") {
        out.pattern = Some(parse_string(v, "pattern")?);
    }
    if let Some(v) = batch.get("extensions") {
        out.extensions = Some(parse_string_array(v, "extensions")?);
    }
    if let Some(v) = batch.get("recursive") {
        out.recursive = Some(parse_bool(v, "recursive")?);
    }
    if let Some(v) = batch.get("overwrite") {
        out.overwrite = Some(parse_bool(v, "overwrite")?);
    }
    if let Some(v) = batch.get("max_input_mb") {
        out.max_input_mb = Some(parse_u64(v, "max_input_mb")?);
    }
    if let Some(v) = batch.get("cache_capacity") {
        out.cache_capacity = Some(parse_u64(v, "cache_capacity")? as usize);
    }
    if let Some(v) = batch.get("working_dir") {
        out.working_dir = Some(parse_string(v, "working_dir")?);
    }
    if let Some(v) = batch.get("env") {
        let table = v
            .as_object()
            .ok_or_else(|| SettingsError::InvalidFieldType {
                field: String::from("env"),
            })?;
        let mut env = BTreeMap::new();
        for (key, value) in table {
            let value = value
                .as_str()
                .ok_or_else(|| SettingsError::InvalidFieldType {
                    field: format!("env.{key}"),
                })?;
            env.insert(key.clone(), value.to_string());
        }
        out.env = Some(env);
    }
    if let Some(v) = batch.get("success") {
        out.success = Some(serde_json::from_value::<SuccessPolicy>(v.clone()).map_err(|_| {
            SettingsError::InvalidFieldType {
                field: String::from("success"),
            }
        })?);
    }
    Ok(out)
}

pub fn load_env_overlay() -> Result<BatchSettingsOverlay, SettingsError> {
    overlay_from_env(|name| std::env::var(name).ok())
}

/// Reads `INKBATCH_*` variables through `lookup`.
pub fn overlay_from_env<F>(lookup: F) -> Result<BatchSettingsOverlay, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |suffix: &str| {
        let name = format!("{ENV_PREFIX}{suffix}");
        lookup(name.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (name, v))
    };
    let number = |suffix: &str| -> Result<Option<u64>, SettingsError> {
        match read(suffix) {
            None => Ok(None),
            Some((name, value)) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| SettingsError::InvalidEnv { name, value }),
        }
    };
    let flag = |suffix: &str| -> Result<Option<bool>, SettingsError> {
        match read(suffix) {
            None => Ok(None),
            Some((name, value)) => parse_flag(value.as_str())
                .map(Some)
                .ok_or(SettingsError::InvalidEnv { name, value }),
        }
    };

    Ok(BatchSettingsOverlay {
        executable: read("EXECUTABLE").map(|(_, v)| v),
        max_workers: number("MAX_WORKERS")?.map(|v| v as usize),
        timeout_secs: number("TIMEOUT_SECS")?,
        kill_grace_ms: number("KILL_GRACE_MS")?,
        pattern: read("PATTERN").map(|(_, v)| v),
        extensions: read("EXTENSIONS").map(|(_, v)| split_list(v.as_str())),
        recursive: flag("RECURSIVE")?,
        overwrite: flag("OVERWRITE")?,
        max_input_mb: number("MAX_INPUT_MB")?,
        cache_capacity: number("CACHE_CAPACITY")?.map(|v| v as usize),
        working_dir: read("WORKING_DIR").map(|(_, v)| v),
        env: None,
        success: None,
    })
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Later layers win: `file` < `env` < `overrides`.
pub fn merge_settings_overlays(
    file: &BatchSettingsOverlay,
    env: &BatchSettingsOverlay,
    overrides: &BatchSettingsOverlay,
) -> BatchSettingsOverlay {
    BatchSettingsOverlay {
        executable: choose_string(
            overrides.executable.as_deref(),
            env.executable.as_deref(),
            file.executable.as_deref(),
        ),
        max_workers: overrides.max_workers.or(env.max_workers).or(file.max_workers),
        timeout_secs: overrides
            .timeout_secs
            .or(env.timeout_secs)
            .or(file.timeout_secs),
        kill_grace_ms: overrides
            .kill_grace_ms
            .or(env.kill_grace_ms)
            .or(file.kill_grace_ms),
        pattern: choose_string(
            overrides.pattern.as_deref(),
            env.pattern.as_deref(),
            file.pattern.as_deref(),
        ),
        extensions: overrides
            .extensions
            .clone()
            .or_else(|| env.extensions.clone())
            .or_else(|| file.extensions.clone()),
        recursive: overrides.recursive.or(env.recursive).or(file.recursive),
        overwrite: overrides.overwrite.or(env.overwrite).or(file.overwrite),
        max_input_mb: overrides
            .max_input_mb
            .or(env.max_input_mb)
            .or(file.max_input_mb),
        cache_capacity: overrides
            .cache_capacity
            .or(env.cache_capacity)
            .or(file.cache_capacity),
        working_dir: choose_string(
            overrides.working_dir.as_deref(),
            env.working_dir.as_deref(),
            file.working_dir.as_deref(),
        ),
        env: merge_env(
            file.env.as_ref(),
            env.env.as_ref(),
            overrides.env.as_ref(),
        ),
        success: overrides
            .success
            .clone()
            .or_else(|| env.success.clone())
            .or_else(|| file.success.clone()),
    }
}

fn merge_env(
    file: Option<&BTreeMap<String, String>>,
    env: Option<&BTreeMap<String, String>>,
    overrides: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    if file.is_none() && env.is_none() && overrides.is_none() {
        return None;
    }
    let mut merged = BTreeMap::new();
    for layer in [file, env, overrides].into_iter().flatten() {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Some(merged)
}

/// Applies an overlay on top of defaults and validates the result.
pub fn resolve_settings(overlay: &BatchSettingsOverlay) -> Result<BatchSettings, SettingsError> {
    let defaults = BatchSettings::default();
    let settings = BatchSettings {
        executable: overlay.executable.as_deref().map(PathBuf::from),
        max_workers: overlay.max_workers.unwrap_or(defaults.max_workers),
        timeout_secs: overlay.timeout_secs.unwrap_or(defaults.timeout_secs),
        kill_grace_ms: overlay.kill_grace_ms.unwrap_or(defaults.kill_grace_ms),
        pattern: overlay.pattern.clone().unwrap_or(defaults.pattern),
        extensions: overlay.extensions.clone().unwrap_or(defaults.extensions),
        recursive: overlay.recursive.unwrap_or(defaults.recursive),
        overwrite: overlay.overwrite.unwrap_or(defaults.overwrite),
        max_input_mb: overlay.max_input_mb.unwrap_or(defaults.max_input_mb),
        cache_capacity: overlay.cache_capacity.unwrap_or(defaults.cache_capacity),
        working_dir: overlay.working_dir.as_deref().map(PathBuf::from),
        env: overlay.env.clone().unwrap_or(defaults.env),
        success: overlay.success.clone().unwrap_or(defaults.success),
    };
    settings.validate()?;
    Ok(settings)
}

fn choose_string(a: Option<&str>, b: Option<&str>, c: Option<&str>) -> Option<String> {
    a.or(b).or(c).map(str::to_string)
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_u64(value: &Value, field: &str) -> Result<u64, SettingsError> {
    value
        .as_u64()
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_bool(value: &Value, field: &str) -> Result<bool, SettingsError> {
    value
        .as_bool()
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_string_array(value: &Value, field: &str) -> Result<Vec<String>, SettingsError> {
    let arr = value
        .as_array()
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(parse_string(item, field)?);
    }
    Ok(out)
}
