//! JSON envelope printed by the CLI.

use serde::Serialize;
use serde_json::Value;

use crate::batch::settings::SettingsError;
use crate::batch::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Config,
    Tool,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EnvelopeError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details,
        }
    }
}

impl From<&BatchError> for EnvelopeError {
    fn from(err: &BatchError) -> Self {
        let (kind, code) = match err {
            BatchError::InvalidInput(_) => (ErrorKind::Validation, "invalid_input"),
            BatchError::InvalidConfig(_) => (ErrorKind::Config, "invalid_config"),
            BatchError::ExecutableNotFound(_) => (ErrorKind::Tool, "executable_not_found"),
            BatchError::Settings(SettingsError::OutOfRange { .. }) => {
                (ErrorKind::Config, "invalid_config")
            }
            BatchError::Settings(_) => (ErrorKind::Config, "settings_error"),
        };
        Self::new(kind, code, err.to_string(), None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

pub fn success<T>(payload: T) -> Envelope<T>
where
    T: Serialize,
{
    Envelope {
        ok: true,
        data: Some(payload),
        error: None,
    }
}

pub fn failure(error: EnvelopeError) -> Envelope<Value> {
    Envelope {
        ok: false,
        data: None,
        error: Some(error),
    }
}

/// A batch that ran is reported as `ok` only when no job failed; the summary
/// is attached either way.
pub fn batch_outcome<T>(payload: T, failed: usize) -> Envelope<T>
where
    T: Serialize,
{
    Envelope {
        ok: failed == 0,
        data: Some(payload),
        error: (failed > 0).then(|| {
            EnvelopeError::new(
                ErrorKind::Tool,
                "jobs_failed",
                format!("{failed} job(s) failed"),
                None,
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn failure_envelope_omits_data() {
        let err = BatchError::ExecutableNotFound(PathBuf::from("/opt/inkscape"));
        let json = serde_json::to_value(failure(EnvelopeError::from(&err))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ok": false,
                "error": {
                    "kind": "tool",
                    "code": "executable_not_found",
                    "message": "executable not found: /opt/inkscape"
                }
            })
        );
    }

    #[test]
    fn batch_outcome_flags_failed_jobs() {
        let clean = serde_json::to_value(batch_outcome(serde_json::json!({"total": 2}), 0)).unwrap();
        assert_eq!(clean, serde_json::json!({"ok": true, "data": {"total": 2}}));

        let partial = batch_outcome(serde_json::json!({"total": 2}), 1);
        assert!(!partial.ok);
        assert_eq!(partial.error.map(|e| e.code), Some(String::from("jobs_failed")));
        assert!(partial.data.is_some());
    }
}
