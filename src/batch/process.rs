use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CAPTURED_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("executable not found: {}", program.display())]
    ExecutableNotFound { program: PathBuf },
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} timed out after {}s and was terminated", program.display(), timeout.as_secs_f64())]
    Timeout { program: PathBuf, timeout: Duration },
    #[error("{} was terminated because the batch was cancelled", program.display())]
    Cancelled { program: PathBuf },
    #[error("failed waiting for {}: {source}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[async_trait]
pub trait ProcessRunner: Send + Sync + 'static {
    async fn invoke(
        &self,
        invocation: &ProcessInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError>;
}

#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    kill_grace: Duration,
    max_captured_bytes: usize,
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            max_captured_bytes: DEFAULT_MAX_CAPTURED_BYTES,
        }
    }
}

enum Outcome {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_max_captured_bytes(mut self, max_captured_bytes: usize) -> Self {
        self.max_captured_bytes = max_captured_bytes;
        self
    }

    fn build_command(invocation: &ProcessInvocation) -> Command {
        let mut command = Command::new(invocation.program.as_os_str());
        command
            .args(invocation.args.iter())
            .envs(invocation.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = invocation.cwd.as_ref() {
            command.current_dir(cwd.as_path());
        }
        // Own process group so a kill reaches everything the tool forked.
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(pid, GroupSignal::Terminate);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if tokio::time::timeout(self.kill_grace, child.wait())
            .await
            .is_err()
        {
            warn!(pid, "process ignored SIGTERM, killing");
            signal_group(pid, GroupSignal::Kill);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        signal_group(pid, GroupSignal::Kill);
    }

    async fn collect(&self, handle: JoinHandle<String>) -> String {
        match tokio::time::timeout(self.kill_grace, handle).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => String::new(),
            Err(_) => {
                warn!("output pipe still open after exit, dropping remaining output");
                String::new()
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn invoke(
        &self,
        invocation: &ProcessInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let program = invocation.program.clone();
        if program.is_absolute() && !program.is_file() {
            return Err(ProcessError::ExecutableNotFound { program });
        }

        let mut child = Self::build_command(invocation)
            .spawn()
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ProcessError::ExecutableNotFound {
                    program: program.clone(),
                },
                _ => ProcessError::Spawn {
                    program: program.clone(),
                    source,
                },
            })?;
        let pid = child.id();
        debug!(pid, program = %program.display(), args = ?invocation.args, "spawned process");

        let cap = self.max_captured_bytes;
        let stdout = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), cap));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(invocation.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(Ok(status)) => {
                // Sweep anything the tool left behind in its group.
                signal_group(pid, GroupSignal::Kill);
                Ok(ProcessOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: self.collect(stdout).await,
                    stderr: self.collect(stderr).await,
                })
            }
            Outcome::Exited(Err(source)) => {
                self.terminate(&mut child, pid).await;
                stdout.abort();
                stderr.abort();
                Err(ProcessError::Wait { program, source })
            }
            Outcome::TimedOut => {
                self.terminate(&mut child, pid).await;
                stdout.abort();
                stderr.abort();
                Err(ProcessError::Timeout {
                    program,
                    timeout: invocation.timeout,
                })
            }
            Outcome::Cancelled => {
                self.terminate(&mut child, pid).await;
                stdout.abort();
                stderr.abort();
                Err(ProcessError::Cancelled { program })
            }
        }
    }
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the cap so the child never blocks on a full pipe.
                let room = cap.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(captured.as_slice()).to_string()
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(errno) = killpg(Pid::from_raw(raw), signal) {
        if errno != nix::errno::Errno::ESRCH {
            debug!(pgid = raw, %errno, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(String),
}

/// Decides whether a finished process actually did its job.
pub trait SuccessPredicate: Send + Sync {
    fn evaluate(&self, output: &ProcessOutput) -> Verdict;
}

impl<F> SuccessPredicate for F
where
    F: Fn(&ProcessOutput) -> Verdict + Send + Sync,
{
    fn evaluate(&self, output: &ProcessOutput) -> Verdict {
        self(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SuccessPolicy {
    #[default]
    ExitCodeZero,
    StdoutMarker(String),
    RejectStderr(String),
}

impl SuccessPredicate for SuccessPolicy {
    fn evaluate(&self, output: &ProcessOutput) -> Verdict {
        if output.exit_code != 0 {
            return Verdict::Failure(format!(
                "exit code {}: {}",
                output.exit_code,
                stderr_excerpt(output.stderr.as_str())
            ));
        }
        match self {
            Self::ExitCodeZero => Verdict::Success,
            Self::StdoutMarker(marker) => {
                if output.stdout.contains(marker.as_str()) {
                    Verdict::Success
                } else {
                    Verdict::Failure(format!(
                        "tool exited 0 but stdout lacks success marker '{marker}': {}",
                        stderr_excerpt(output.stderr.as_str())
                    ))
                }
            }
            Self::RejectStderr(needle) => {
                if output.stderr.contains(needle.as_str()) {
                    Verdict::Failure(format!(
                        "tool exited 0 but reported '{needle}': {}",
                        stderr_excerpt(output.stderr.as_str())
                    ))
                } else {
                    Verdict::Success
                }
            }
        }
    }
}

const STDERR_EXCERPT_CHARS: usize = 2000;

pub fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::from("(no stderr)");
    }
    let count = trimmed.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail = trimmed
        .chars()
        .skip(count - STDERR_EXCERPT_CHARS)
        .collect::<String>();
    format!("...{tail}")
}
