use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::batch::{JobId, JobResult, JobStatus};

pub const MAX_FAILED_FILES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub operation: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub success_rate: f64,
    /// Failed and timed-out jobs in the order they completed.
    pub failed_jobs: Vec<JobResult>,
    /// Every result, ordered by job id.
    pub results: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_elapsed_ms")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.total == self.succeeded + self.failed + self.skipped
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary::from_report(self)
    }
}

pub fn success_rate(succeeded: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    succeeded as f64 / total as f64
}

fn serialize_elapsed_ms<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct AggregateState {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    failed_jobs: Vec<JobResult>,
    results: Vec<JobResult>,
    recorded: HashSet<JobId>,
}

/// Collects job results as workers finish, in whatever order that happens.
#[derive(Debug)]
pub struct ResultAggregator {
    batch_id: Uuid,
    operation: String,
    total: usize,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<AggregateState>,
}

impl ResultAggregator {
    pub fn new(operation: impl Into<String>, total: usize) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            operation: operation.into(),
            total,
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(AggregateState::default()),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Returns false when the job already has a result; the first one wins.
    pub fn record(&self, result: JobResult) -> bool {
        let mut state = self.state.lock();
        if !state.recorded.insert(result.job_id) {
            warn!(job_id = result.job_id, "duplicate job result ignored");
            return false;
        }
        match result.status {
            JobStatus::Succeeded => state.succeeded += 1,
            JobStatus::Failed | JobStatus::TimedOut => {
                state.failed += 1;
                state.failed_jobs.push(result.clone());
            }
            JobStatus::Skipped => state.skipped += 1,
            JobStatus::Pending | JobStatus::Running => {
                warn!(
                    job_id = result.job_id,
                    status = result.status.as_str(),
                    "non-terminal result recorded as failure"
                );
                state.failed += 1;
                state.failed_jobs.push(result.clone());
            }
        }
        state.results.push(result);
        true
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            total: self.total,
            completed: state.results.len(),
            succeeded: state.succeeded,
            failed: state.failed,
            skipped: state.skipped,
        }
    }

    pub fn has_result(&self, job_id: JobId) -> bool {
        self.state.lock().recorded.contains(&job_id)
    }

    pub fn finish(self, cancelled: bool) -> BatchReport {
        let elapsed = self.started.elapsed();
        let mut state = self.state.into_inner();
        state.results.sort_by_key(|r| r.job_id);
        BatchReport {
            batch_id: self.batch_id,
            operation: self.operation,
            total: self.total,
            succeeded: state.succeeded,
            failed: state.failed,
            skipped: state.skipped,
            cancelled,
            success_rate: success_rate(state.succeeded, self.total),
            failed_jobs: state.failed_jobs,
            results: state.results,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

/// Caller-facing view of a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub operation: String,
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_files: Vec<FailedFile>,
    /// Percentage in `0.0..=100.0`.
    pub success_rate: f64,
    pub cancelled: bool,
    pub message: String,
    pub execution_time_ms: f64,
}

impl BatchSummary {
    pub fn from_report(report: &BatchReport) -> Self {
        let mut failed_jobs = report.failed_jobs.iter().collect::<Vec<_>>();
        failed_jobs.sort_by_key(|r| r.job_id);
        let failed_files = failed_jobs
            .into_iter()
            .take(MAX_FAILED_FILES)
            .map(|r| FailedFile {
                path: r.input_path.clone(),
                error: r
                    .error_message
                    .clone()
                    .unwrap_or_else(|| String::from(r.status.as_str())),
            })
            .collect();

        let millis = report.elapsed.as_secs_f64() * 1000.0;
        Self {
            operation: report.operation.clone(),
            total: report.total,
            processed: report.processed(),
            successful: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            failed_files,
            success_rate: report.success_rate * 100.0,
            cancelled: report.cancelled,
            message: format!(
                "Processed {}/{} files ({} failed, {} skipped)",
                report.succeeded, report.total, report.failed, report.skipped
            ),
            execution_time_ms: (millis * 100.0).round() / 100.0,
        }
    }
}
