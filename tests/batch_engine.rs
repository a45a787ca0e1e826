#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use inkbatch_core::batch::command::{CommandTemplate, TemplateArg};
use inkbatch_core::batch::enumerate::{enumerate_inputs, plan_jobs, InputSelection, OutputNaming};
use inkbatch_core::batch::pool::{BatchRequest, WorkerPool};
use inkbatch_core::batch::process::TokioProcessRunner;
use inkbatch_core::batch::report::BatchSummary;
use inkbatch_core::batch::{BatchError, Job, JobErrorKind, JobStatus};

fn scratch() -> TempDir {
    tempfile::Builder::new()
        .prefix("inkbatch_engine_")
        .tempdir()
        .expect("scratch dir should exist")
}

fn write_inputs(root: &Path, names: &[&str]) -> PathBuf {
    let input_dir = root.join("in");
    for name in names {
        let path = input_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("input dir should exist");
        }
        fs::write(path, format!("<svg id='{name}'/>")).expect("input fixture");
    }
    fs::create_dir_all(input_dir.as_path()).expect("input dir should exist");
    input_dir
}

/// The fake tool is a shell script run as `/bin/sh <script> <input> <output>`.
fn write_tool(root: &Path, body: &str) -> PathBuf {
    let path = root.join("tool.sh");
    fs::write(path.as_path(), body).expect("tool script should be written");
    path
}

fn plan(root: &Path, input_dir: &Path, tool: &Path) -> Result<Vec<Job>, BatchError> {
    let inputs = enumerate_inputs(&InputSelection::new(input_dir, "*.svg").recursive(true))?;
    let template = CommandTemplate::new(vec![
        TemplateArg::literal(tool.to_string_lossy().to_string()),
        TemplateArg::input(),
        TemplateArg::output(),
    ]);
    Ok(plan_jobs(
        inputs.as_slice(),
        input_dir,
        root.join("out").as_path(),
        &OutputNaming::ChangeExtension(String::from("png")),
        &template,
    )?)
}

fn request(jobs: Vec<Job>) -> BatchRequest {
    BatchRequest::new("export", "/bin/sh", jobs).with_timeout(Duration::from_secs(10))
}

fn leftover_staging_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(leftover_staging_files(path.as_path()));
        } else if entry.file_name().to_string_lossy().contains(".partial-") {
            found.push(path);
        }
    }
    found
}

fn without_timing(mut summary: BatchSummary) -> BatchSummary {
    summary.execution_time_ms = 0.0;
    summary
}

#[tokio::test]
async fn five_inputs_two_workers_all_succeed() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "b.svg", "c.svg", "d.svg", "e.svg"]);
    let tool = write_tool(dir.path(), "cp \"$1\" \"$2\"\n");
    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");

    let report = WorkerPool::new(2)
        .expect("pool should build")
        .submit(request(jobs), &CancellationToken::new())
        .await
        .expect("batch should run");
    let summary = report.summary();

    assert_eq!(
        (summary.total, summary.successful, summary.failed, summary.success_rate),
        (5, 5, 0, 100.0)
    );
    assert_eq!(summary.message, "Processed 5/5 files (0 failed, 0 skipped)");
    for name in ["a", "b", "c", "d", "e"] {
        assert_eq!(
            fs::read_to_string(dir.path().join("out").join(format!("{name}.png"))).unwrap(),
            format!("<svg id='{name}.svg'/>")
        );
    }
    assert!(leftover_staging_files(dir.path()).is_empty());
}

#[tokio::test]
async fn permission_denied_output_fails_only_that_job() {
    if nix::unistd::geteuid().is_root() {
        // Root ignores directory permissions.
        return;
    }
    use std::os::unix::fs::PermissionsExt;

    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "locked/b.svg", "c.svg"]);
    let tool = write_tool(dir.path(), "cp \"$1\" \"$2\"\n");
    let locked = dir.path().join("out/locked");
    fs::create_dir_all(locked.as_path()).unwrap();
    fs::set_permissions(locked.as_path(), fs::Permissions::from_mode(0o555)).unwrap();

    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");
    let report = WorkerPool::new(2)
        .unwrap()
        .submit(request(jobs), &CancellationToken::new())
        .await
        .expect("batch should run");
    fs::set_permissions(locked.as_path(), fs::Permissions::from_mode(0o755)).unwrap();

    let summary = report.summary();
    assert_eq!((summary.total, summary.successful, summary.failed), (3, 2, 1));
    assert_eq!(summary.failed_files.len(), 1);
    assert_eq!(summary.failed_files[0].path, input_dir.join("locked/b.svg"));
    assert!(
        summary.failed_files[0].error.starts_with("PermissionError"),
        "unexpected error: {}",
        summary.failed_files[0].error
    );
    assert!(!locked.join("b.png").exists());
}

fn process_gone(pid: &str) -> bool {
    let stat = Path::new("/proc").join(pid.trim()).join("stat");
    match fs::read_to_string(stat) {
        Err(_) => true,
        // Reaped by whoever adopted it, or a zombie waiting for that.
        Ok(raw) => raw
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

#[tokio::test]
async fn timed_out_job_leaves_no_process_behind() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["slow.svg"]);
    let pids = dir.path().join("pids");
    let tool = write_tool(
        dir.path(),
        format!(
            "echo $$ > '{0}/shell.pid'\nsleep 5 &\necho $! > '{0}/child.pid'\nwait\ncp \"$1\" \"$2\"\n",
            pids.display()
        )
        .as_str(),
    );
    fs::create_dir_all(pids.as_path()).unwrap();
    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");

    let pool = WorkerPool::new(1)
        .unwrap()
        .with_runner(Arc::new(
            TokioProcessRunner::new().with_kill_grace(Duration::from_millis(500)),
        ));
    let started = Instant::now();
    let report = pool
        .submit(
            request(jobs).with_timeout(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await
        .expect("batch should run");
    let elapsed = started.elapsed();

    let result = &report.results[0];
    assert_eq!(result.status, JobStatus::TimedOut);
    assert_eq!(result.error_kind, Some(JobErrorKind::ProcessTimeout));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    assert_eq!(report.summary().failed, 1);
    assert!(!dir.path().join("out/slow.png").exists());
    assert!(leftover_staging_files(dir.path()).is_empty());

    for name in ["shell.pid", "child.pid"] {
        let pid = fs::read_to_string(pids.join(name)).expect("tool should record its pid");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !process_gone(pid.as_str()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(process_gone(pid.as_str()), "{name} {} survived", pid.trim());
    }
}

#[tokio::test]
async fn empty_input_directory_fails_before_any_job() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &[]);
    let tool = write_tool(dir.path(), "exit 0\n");

    let err = plan(dir.path(), input_dir.as_path(), tool.as_path())
        .expect_err("empty input must fail");
    assert!(matches!(err, BatchError::InvalidInput(_)));
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn failing_tool_leaves_no_partial_output() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "b.svg", "c.svg"]);
    let tool = write_tool(
        dir.path(),
        concat!(
            "case \"$1\" in\n",
            "  */a.svg) printf half > \"$2\"; echo 'render crashed' >&2; exit 3 ;;\n",
            "  */b.svg) : > \"$2\" ;;\n",
            "  *) cp \"$1\" \"$2\" ;;\n",
            "esac\n"
        ),
    );
    fs::create_dir_all(dir.path().join("out")).unwrap();
    fs::write(dir.path().join("out/a.png"), b"previous").unwrap();

    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");
    let report = WorkerPool::new(3)
        .unwrap()
        .submit(request(jobs).overwrite(true), &CancellationToken::new())
        .await
        .expect("batch should run");

    let kinds = report
        .results
        .iter()
        .map(|r| r.error_kind)
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            Some(JobErrorKind::OperationFailure),
            Some(JobErrorKind::PartialWriteGuard),
            None
        ]
    );
    assert_eq!(
        report.results[0].error_message.as_deref(),
        Some("exit code 3: render crashed")
    );
    assert_eq!(fs::read(dir.path().join("out/a.png")).unwrap(), b"previous");
    assert!(!dir.path().join("out/b.png").exists());
    assert!(dir.path().join("out/c.png").exists());
    assert!(leftover_staging_files(dir.path()).is_empty());
}

async fn summaries_of_two_runs(root: &Path, input_dir: &Path, tool: &Path, program: &Path) -> Vec<BatchSummary> {
    let pool = WorkerPool::new(2).unwrap();
    let mut summaries = Vec::new();
    for _ in 0..2 {
        let jobs = plan(root, input_dir, tool).expect("jobs should plan");
        let report = pool
            .submit(
                BatchRequest::new("export", program, jobs).with_timeout(Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .expect("batch should run");
        summaries.push(without_timing(report.summary()));
    }
    summaries
}

#[tokio::test]
async fn rerunning_an_all_failing_batch_gives_the_same_summary() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "b.svg", "c.svg", "d.svg"]);
    let tool = write_tool(dir.path(), "echo \"cannot open $1\" >&2\nexit 1\n");

    let summaries =
        summaries_of_two_runs(dir.path(), input_dir.as_path(), tool.as_path(), Path::new("/bin/sh")).await;
    assert_eq!(summaries[0], summaries[1]);
    assert_eq!(summaries[0].failed, 4);
    assert_eq!(summaries[0].success_rate, 0.0);
    assert!(summaries[0].failed_files[0].error.contains("cannot open"));
    assert!(leftover_staging_files(dir.path()).is_empty());

    let fresh = scratch();
    let input_dir = write_inputs(fresh.path(), &["a.svg", "b.svg", "sub/c.svg"]);
    let missing = fresh.path().join("no/such/inkscape");
    let summaries =
        summaries_of_two_runs(fresh.path(), input_dir.as_path(), tool.as_path(), missing.as_path()).await;
    assert_eq!(summaries[0], summaries[1]);
    assert_eq!(summaries[0].failed, 3);
    assert!(summaries[0].failed_files[0].error.starts_with("executable not found"));
    assert!(!fresh.path().join("out").exists());
}

#[tokio::test]
async fn existing_outputs_are_skipped_without_overwrite() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "b.svg"]);
    let tool = write_tool(dir.path(), "cp \"$1\" \"$2\"\n");
    fs::create_dir_all(dir.path().join("out")).unwrap();
    fs::write(dir.path().join("out/a.png"), b"keep").unwrap();

    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");
    let summary = WorkerPool::new(2)
        .unwrap()
        .submit(request(jobs), &CancellationToken::new())
        .await
        .expect("batch should run")
        .summary();

    assert_eq!((summary.successful, summary.skipped, summary.processed), (1, 1, 1));
    assert_eq!(summary.message, "Processed 1/2 files (0 failed, 1 skipped)");
    assert_eq!(fs::read(dir.path().join("out/a.png")).unwrap(), b"keep");
}

#[tokio::test]
async fn cancelling_stops_running_tools_and_skips_the_rest() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg", "b.svg", "c.svg", "d.svg"]);
    let tool = write_tool(dir.path(), "sleep 5\ncp \"$1\" \"$2\"\n");
    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let pool = WorkerPool::new(2)
        .unwrap()
        .with_runner(Arc::new(
            TokioProcessRunner::new().with_kill_grace(Duration::from_millis(500)),
        ));
    let started = Instant::now();
    let report = pool
        .submit(request(jobs), &cancel)
        .await
        .expect("cancelled batch still reports");

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(report.cancelled);
    assert!(report.is_complete());
    assert_eq!((report.failed, report.skipped, report.succeeded), (2, 2, 0));
    assert!(leftover_staging_files(dir.path()).is_empty());
}

#[tokio::test]
async fn missing_executable_fails_each_job() {
    let dir = scratch();
    let input_dir = write_inputs(dir.path(), &["a.svg"]);
    let tool = write_tool(dir.path(), "exit 0\n");
    let jobs = plan(dir.path(), input_dir.as_path(), tool.as_path()).expect("jobs should plan");

    let report = WorkerPool::new(1)
        .unwrap()
        .submit(
            BatchRequest::new("export", "/no/such/inkscape", jobs),
            &CancellationToken::new(),
        )
        .await
        .expect("batch should run");
    assert_eq!(
        report.results[0].error_kind,
        Some(JobErrorKind::ExecutableNotFound)
    );
    assert_eq!(report.failed, 1);
}
