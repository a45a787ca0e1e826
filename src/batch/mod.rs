pub mod cache;
pub mod command;
pub mod enumerate;
pub mod glob;
pub mod pool;
pub mod process;
pub mod report;
pub mod settings;
pub mod staging;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::batch::command::CommandTemplate;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl JobStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{Failed, Pending, Running, Skipped, Succeeded, TimedOut};

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub command: CommandTemplate,
    status: JobStatus,
}

impl Job {
    pub fn new(
        id: JobId,
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        command: CommandTemplate,
    ) -> Self {
        Self {
            id,
            input_path: input_path.into(),
            output_path: output_path.into(),
            command,
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), JobTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(JobTransitionError {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {job_id} cannot move from {} to {}", from.as_str(), to.as_str())]
pub struct JobTransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    InvalidInput,
    ExecutableNotFound,
    ProcessSpawn,
    ProcessTimeout,
    OperationFailure,
    PartialWriteGuard,
    OutputIo,
    Cancelled,
    Panicked,
}

impl JobErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::ExecutableNotFound => "executable_not_found",
            Self::ProcessSpawn => "process_spawn",
            Self::ProcessTimeout => "process_timeout",
            Self::OperationFailure => "operation_failure",
            Self::PartialWriteGuard => "partial_write_guard",
            Self::OutputIo => "output_io",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Exists,
    TooLarge,
    Cached,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::TooLarge => "too_large",
            Self::Cached => "cached",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<JobErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

impl JobResult {
    pub fn succeeded(job: &Job, duration: Duration) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Succeeded,
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            error_kind: None,
            error_message: None,
            skip_reason: None,
            duration,
        }
    }

    pub fn failed(
        job: &Job,
        kind: JobErrorKind,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let status = if kind == JobErrorKind::ProcessTimeout {
            JobStatus::TimedOut
        } else {
            JobStatus::Failed
        };
        Self {
            job_id: job.id,
            status,
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
            skip_reason: None,
            duration,
        }
    }

    pub fn skipped(job: &Job, reason: SkipReason) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Skipped,
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            error_kind: None,
            error_message: None,
            skip_reason: Some(reason),
            duration: Duration::ZERO,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::TimedOut)
    }
}

fn serialize_duration_ms<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid batch configuration: {0}")]
    InvalidConfig(String),
    #[error("executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),
    #[error(transparent)]
    Settings(#[from] settings::SettingsError),
}

impl From<enumerate::EnumerateError> for BatchError {
    fn from(value: enumerate::EnumerateError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}
