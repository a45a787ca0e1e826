//! Bounded worker pool that runs one external process per job.
//!
//! Clones share one semaphore, so every batch submitted through any clone
//! counts against the same `max_workers` ceiling.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::batch::cache::{CacheKey, JobCache};
use crate::batch::process::{
    ProcessError, ProcessInvocation, ProcessRunner, SuccessPolicy, SuccessPredicate,
    TokioProcessRunner, Verdict,
};
use crate::batch::report::{BatchReport, ResultAggregator};
use crate::batch::staging::{OutputStager, SiblingTempStager, StagedOutput};
use crate::batch::{
    BatchError, Job, JobErrorKind, JobId, JobResult, JobStatus, SkipReason,
};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub operation: String,
    pub program: PathBuf,
    pub jobs: Vec<Job>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub overwrite: bool,
    pub max_input_bytes: Option<u64>,
}

impl BatchRequest {
    pub fn new(operation: impl Into<String>, program: impl Into<PathBuf>, jobs: Vec<Job>) -> Self {
        Self {
            operation: operation.into(),
            program: program.into(),
            jobs,
            timeout: DEFAULT_JOB_TIMEOUT,
            env: BTreeMap::new(),
            cwd: None,
            overwrite: false,
            max_input_bytes: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_max_input_bytes(mut self, max_input_bytes: u64) -> Self {
        self.max_input_bytes = Some(max_input_bytes);
        self
    }

    fn validate(&self) -> Result<(), BatchError> {
        if self.program.as_os_str().is_empty() {
            return Err(BatchError::InvalidConfig(String::from(
                "program path must not be empty",
            )));
        }
        if self.timeout.is_zero() {
            return Err(BatchError::InvalidConfig(String::from(
                "job timeout must be greater than zero",
            )));
        }
        let mut seen = HashSet::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if !seen.insert(job.id) {
                return Err(BatchError::InvalidInput(format!(
                    "job id {} appears more than once",
                    job.id
                )));
            }
            if job.status() != JobStatus::Pending {
                return Err(BatchError::InvalidInput(format!(
                    "job {} was submitted in state {}",
                    job.id,
                    job.status().as_str()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    runner: Arc<dyn ProcessRunner>,
    predicate: Arc<dyn SuccessPredicate>,
    stager: Arc<dyn OutputStager>,
    cache: Option<JobCache>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("available", &self.permits.available_permits())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Result<Self, BatchError> {
        if max_workers < 1 {
            return Err(BatchError::InvalidConfig(String::from(
                "max_workers must be at least 1",
            )));
        }
        Ok(Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            runner: Arc::new(TokioProcessRunner::new()),
            predicate: Arc::new(SuccessPolicy::ExitCodeZero),
            stager: Arc::new(SiblingTempStager),
            cache: None,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn SuccessPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_stager(mut self, stager: Arc<dyn OutputStager>) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_cache(mut self, cache: JobCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs every job and returns once each one has a result.
    ///
    /// Job failures never abort the batch. Cancelling `cancel` stops new job
    /// starts and terminates processes already running; the report is still
    /// returned with whatever completed.
    pub async fn submit(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        request.validate()?;
        let BatchRequest {
            operation,
            program,
            jobs,
            timeout,
            env,
            cwd,
            overwrite,
            max_input_bytes,
        } = request;

        let aggregator = ResultAggregator::new(operation.as_str(), jobs.len());
        let span = info_span!(
            "batch",
            batch_id = %aggregator.batch_id(),
            operation = operation.as_str(),
            total = jobs.len(),
            max_workers = self.max_workers,
        );
        let context = Arc::new(JobContext {
            runner: Arc::clone(&self.runner),
            predicate: Arc::clone(&self.predicate),
            stager: Arc::clone(&self.stager),
            cache: self.cache.clone(),
            program,
            timeout,
            env,
            cwd,
            overwrite,
            max_input_bytes,
        });

        async move {
            info!("batch started");
            let mut tasks = JoinSet::new();
            let mut in_flight = HashMap::<Id, Job>::new();
            let mut queue = jobs.into_iter();

            while let Some(job) = queue.next() {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    skip_cancelled(&aggregator, job, queue.by_ref());
                    break;
                };

                let context = Arc::clone(&context);
                let token = cancel.clone();
                let job_span = info_span!("job", job_id = job.id);
                let handle = tasks.spawn(
                    {
                        let job = job.clone();
                        async move {
                            let _permit = permit;
                            execute_job(context, job, token).await
                        }
                    }
                    .instrument(job_span),
                );
                in_flight.insert(handle.id(), job);

                while let Some(joined) = tasks.try_join_next_with_id() {
                    settle(&aggregator, &mut in_flight, joined);
                }
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                settle(&aggregator, &mut in_flight, joined);
            }

            let report = aggregator.finish(cancel.is_cancelled());
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                cancelled = report.cancelled,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "batch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

struct JobContext {
    runner: Arc<dyn ProcessRunner>,
    predicate: Arc<dyn SuccessPredicate>,
    stager: Arc<dyn OutputStager>,
    cache: Option<JobCache>,
    program: PathBuf,
    timeout: Duration,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    overwrite: bool,
    max_input_bytes: Option<u64>,
}

fn skip_cancelled(
    aggregator: &ResultAggregator,
    first: Job,
    rest: impl Iterator<Item = Job>,
) {
    let mut skipped = 0usize;
    for mut job in std::iter::once(first).chain(rest) {
        if let Err(err) = job.advance(JobStatus::Skipped) {
            warn!(%err, "unexpected job state while cancelling");
        }
        aggregator.record(JobResult::skipped(&job, SkipReason::Cancelled));
        skipped += 1;
    }
    info!(skipped, "batch cancelled before all jobs started");
}

fn settle(
    aggregator: &ResultAggregator,
    in_flight: &mut HashMap<Id, Job>,
    joined: Result<(Id, JobResult), JoinError>,
) {
    match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            aggregator.record(result);
        }
        Err(err) => {
            let Some(job) = in_flight.remove(&err.id()) else {
                warn!(%err, "worker task ended without a known job");
                return;
            };
            let result = if err.is_panic() {
                let message = panic_message(err.into_panic());
                warn!(job_id = job.id, message = message.as_str(), "worker panicked");
                JobResult::failed(
                    &job,
                    JobErrorKind::Panicked,
                    format!("worker panicked: {message}"),
                    Duration::ZERO,
                )
            } else {
                JobResult::failed(
                    &job,
                    JobErrorKind::Cancelled,
                    "worker task was aborted",
                    Duration::ZERO,
                )
            };
            aggregator.record(result);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    String::from("unknown panic payload")
}

async fn execute_job(context: Arc<JobContext>, mut job: Job, cancel: CancellationToken) -> JobResult {
    let started = Instant::now();
    let result = run_job(context.as_ref(), &mut job, &cancel, started).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result.status {
        JobStatus::Succeeded | JobStatus::Skipped => info!(
            job_id = job.id,
            input = %job.input_path.display(),
            status = result.status.as_str(),
            skip_reason = result.skip_reason.map(|r| r.as_str()),
            elapsed_ms,
            "job finished"
        ),
        _ => warn!(
            job_id = job.id,
            input = %job.input_path.display(),
            status = result.status.as_str(),
            error_kind = result.error_kind.map(|k| k.as_str()),
            error = result.error_message.as_deref().unwrap_or(""),
            elapsed_ms,
            "job failed"
        ),
    }
    result
}

async fn run_job(
    context: &JobContext,
    job: &mut Job,
    cancel: &CancellationToken,
    started: Instant,
) -> JobResult {
    if cancel.is_cancelled() {
        return skip(job, SkipReason::Cancelled);
    }

    let writes_output = job.command.writes_output();
    let cache_key = match context.cache.clone() {
        Some(cache) => {
            let program = context.program.clone();
            let probe = job.clone();
            let lookup = blocking(move || {
                CacheKey::for_job(program.as_path(), &probe).map(|key| (cache.is_fresh(&key), key))
            })
            .await;
            match lookup {
                Ok(Some((true, _))) => return skip(job, SkipReason::Cached),
                Ok(Some((false, key))) => Some(key),
                Ok(None) | Err(_) => None,
            }
        }
        None => None,
    };

    if writes_output
        && !context.overwrite
        && tokio::fs::try_exists(job.output_path.as_path())
            .await
            .unwrap_or(false)
    {
        return skip(job, SkipReason::Exists);
    }

    let input_len = match tokio::fs::metadata(job.input_path.as_path()).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            return fail(
                job,
                JobErrorKind::InvalidInput,
                format!("input {} is not a regular file", job.input_path.display()),
                started,
            )
        }
        Err(err) => {
            return fail(
                job,
                JobErrorKind::InvalidInput,
                format!("cannot read input {}: {err}", job.input_path.display()),
                started,
            )
        }
    };
    if context.max_input_bytes.is_some_and(|limit| input_len > limit) {
        return skip(job, SkipReason::TooLarge);
    }

    if let Err(err) = job.advance(JobStatus::Running) {
        warn!(%err, "job could not start");
        return JobResult::failed(job, JobErrorKind::InvalidInput, err.to_string(), Duration::ZERO);
    }

    // Checked before staging so a missing tool leaves nothing on disk.
    if context.program.is_absolute() && !is_file(context.program.clone()).await {
        let err = ProcessError::ExecutableNotFound {
            program: context.program.clone(),
        };
        return finish_failed(job, JobErrorKind::ExecutableNotFound, err.to_string(), started);
    }

    let staged = if writes_output {
        let stager = Arc::clone(&context.stager);
        let final_path = job.output_path.clone();
        match blocking(move || stager.stage(final_path.as_path())).await {
            Ok(Ok(staged)) => Some(staged),
            Ok(Err(err)) => return finish_failed(job, JobErrorKind::OutputIo, err.to_string(), started),
            Err(err) => return finish_failed(job, JobErrorKind::OutputIo, err.to_string(), started),
        }
    } else {
        None
    };

    let target = staged
        .as_ref()
        .map(|s| s.path().to_path_buf())
        .unwrap_or_else(|| job.output_path.clone());
    let invocation = ProcessInvocation {
        program: context.program.clone(),
        args: job.command.render(job.input_path.as_path(), target.as_path()),
        env: context.env.clone(),
        cwd: context.cwd.clone(),
        timeout: context.timeout,
    };
    debug!(args = ?invocation.args, "invoking tool");

    let output = match context.runner.invoke(&invocation, cancel).await {
        Ok(output) => output,
        Err(err) => {
            let kind = match &err {
                ProcessError::ExecutableNotFound { .. } => JobErrorKind::ExecutableNotFound,
                ProcessError::Spawn { .. } => JobErrorKind::ProcessSpawn,
                ProcessError::Timeout { .. } => JobErrorKind::ProcessTimeout,
                ProcessError::Cancelled { .. } => JobErrorKind::Cancelled,
                ProcessError::Wait { .. } => JobErrorKind::OperationFailure,
            };
            discard(staged).await;
            return finish_failed(job, kind, err.to_string(), started);
        }
    };

    if let Verdict::Failure(message) = context.predicate.evaluate(&output) {
        discard(staged).await;
        return finish_failed(job, JobErrorKind::OperationFailure, message, started);
    }

    if let Some(staged) = staged {
        match blocking(move || staged.commit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let kind = if err.is_write_guard() {
                    JobErrorKind::PartialWriteGuard
                } else {
                    JobErrorKind::OutputIo
                };
                return finish_failed(job, kind, err.to_string(), started);
            }
            Err(err) => return finish_failed(job, JobErrorKind::OutputIo, err.to_string(), started),
        }
    }

    if let (Some(cache), Some(key)) = (context.cache.clone(), cache_key) {
        if writes_output {
            let output_path = job.output_path.clone();
            if let Err(err) = blocking(move || cache.record(key, output_path.as_path())).await {
                debug!(%err, "cache update did not finish");
            }
        }
    }
    if let Err(err) = job.advance(JobStatus::Succeeded) {
        warn!(%err, "unexpected job state on success");
    }
    JobResult::succeeded(job, started.elapsed())
}

/// Runs filesystem work off the async worker threads.
async fn blocking<T, F>(work: F) -> Result<T, JoinError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await
}

async fn is_file(path: PathBuf) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn discard(staged: Option<StagedOutput>) {
    if let Some(staged) = staged {
        if let Err(err) = blocking(move || staged.discard()).await {
            warn!(%err, "staging cleanup did not finish");
        }
    }
}

fn skip(job: &mut Job, reason: SkipReason) -> JobResult {
    if let Err(err) = job.advance(JobStatus::Skipped) {
        warn!(%err, "unexpected job state on skip");
    }
    JobResult::skipped(job, reason)
}

/// Failure before the job started running.
fn fail(job: &mut Job, kind: JobErrorKind, message: String, started: Instant) -> JobResult {
    if let Err(err) = job.advance(JobStatus::Running) {
        warn!(%err, "unexpected job state on early failure");
    }
    finish_failed(job, kind, message, started)
}

fn finish_failed(job: &mut Job, kind: JobErrorKind, message: String, started: Instant) -> JobResult {
    let next = if kind == JobErrorKind::ProcessTimeout {
        JobStatus::TimedOut
    } else {
        JobStatus::Failed
    };
    if let Err(err) = job.advance(next) {
        warn!(%err, "unexpected job state on failure");
    }
    JobResult::failed(job, kind, message, started.elapsed())
}

/// Ids of jobs that cancellation skipped or cut short.
pub fn unfinished_job_ids(report: &BatchReport) -> Vec<JobId> {
    report
        .results
        .iter()
        .filter(|r| {
            r.skip_reason == Some(SkipReason::Cancelled)
                || r.error_kind == Some(JobErrorKind::Cancelled)
        })
        .map(|r| r.job_id)
        .collect()
}
