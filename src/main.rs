use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use inkbatch_core::batch::cache::JobCache;
use inkbatch_core::batch::enumerate::{enumerate_inputs, plan_jobs, InputSelection, OutputNaming};
use inkbatch_core::batch::pool::{BatchRequest, WorkerPool};
use inkbatch_core::batch::process::TokioProcessRunner;
use inkbatch_core::batch::report::BatchSummary;
use inkbatch_core::batch::settings::{
    load_env_overlay, load_settings_file, merge_settings_overlays, resolve_settings, split_list,
    BatchSettings, BatchSettingsOverlay,
};
use inkbatch_core::batch::BatchError;
use inkbatch_core::inkscape::{validate_executable, ExportType, InkscapeCommand};
use inkbatch_core::output::{batch_outcome, failure, success, EnvelopeError};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let rest = cli_args.iter().skip(1).cloned().collect::<Vec<_>>();
    match cli_args.first().map(String::as_str) {
        Some("run-batch") => {
            if !run_batch_cli(rest).await? {
                std::process::exit(1);
            }
        }
        Some("validate-settings") => {
            if !run_validate_settings_cli(rest)? {
                std::process::exit(1);
            }
        }
        Some("-h") | Some("--help") | None => print_usage(),
        Some(unknown) => {
            return Err(std::io::Error::other(format!(
                "Unknown command: {unknown}\n\nUse --help for usage."
            ))
            .into());
        }
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // stdout carries the JSON envelope.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct RunBatchCliArgs {
    settings_path: Option<String>,
    input_dir: PathBuf,
    output_dir: PathBuf,
    operation: String,
    format: Option<String>,
    rename: Option<String>,
    object_ids: Vec<String>,
    dpi: Option<u32>,
    overrides: BatchSettingsOverlay,
}

fn parse_run_batch_cli_args(args: &[String]) -> Result<RunBatchCliArgs, Box<dyn std::error::Error>> {
    let mut parsed = RunBatchCliArgs {
        operation: String::from("export"),
        ..RunBatchCliArgs::default()
    };
    let mut input_dir = None::<PathBuf>;
    let mut output_dir = None::<PathBuf>;
    let mut env = BTreeMap::<String, String>::new();

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };
        let needs_number = |idx: usize| -> Result<u64, Box<dyn std::error::Error>> {
            let raw = needs_value(idx)?;
            raw.trim().parse::<u64>().map_err(|_| {
                std::io::Error::other(format!("{flag} expects a number, got '{raw}'")).into()
            })
        };

        match flag {
            "--executable" => {
                parsed.overrides.executable = Some(needs_value(i)?);
                i += 2;
            }
            "--input-dir" => {
                input_dir = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--output-dir" => {
                output_dir = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--pattern" => {
                parsed.overrides.pattern = Some(needs_value(i)?);
                i += 2;
            }
            "--ext" => {
                parsed.overrides.extensions = Some(split_list(needs_value(i)?.as_str()));
                i += 2;
            }
            "--recursive" => {
                parsed.overrides.recursive = Some(true);
                i += 1;
            }
            "--overwrite" => {
                parsed.overrides.overwrite = Some(true);
                i += 1;
            }
            "--max-workers" => {
                parsed.overrides.max_workers = Some(needs_number(i)? as usize);
                i += 2;
            }
            "--timeout-secs" => {
                parsed.overrides.timeout_secs = Some(needs_number(i)?);
                i += 2;
            }
            "--kill-grace-ms" => {
                parsed.overrides.kill_grace_ms = Some(needs_number(i)?);
                i += 2;
            }
            "--max-input-mb" => {
                parsed.overrides.max_input_mb = Some(needs_number(i)?);
                i += 2;
            }
            "--cache-capacity" => {
                parsed.overrides.cache_capacity = Some(needs_number(i)? as usize);
                i += 2;
            }
            "--env" => {
                let raw = needs_value(i)?;
                let Some((key, value)) = raw.split_once('=') else {
                    return Err(std::io::Error::other(format!(
                        "--env expects KEY=VALUE, got '{raw}'"
                    ))
                    .into());
                };
                env.insert(key.trim().to_string(), value.to_string());
                i += 2;
            }
            "--action" => {
                parsed.operation = needs_value(i)?;
                i += 2;
            }
            "--format" => {
                parsed.format = Some(needs_value(i)?);
                i += 2;
            }
            "--rename" => {
                parsed.rename = Some(needs_value(i)?);
                i += 2;
            }
            "--object-id" => {
                parsed.object_ids.push(needs_value(i)?);
                i += 2;
            }
            "--dpi" => {
                parsed.dpi = Some(u32::try_from(needs_number(i)?)?);
                i += 2;
            }
            "--settings" => {
                parsed.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    parsed.input_dir = input_dir.ok_or_else(|| std::io::Error::other("Missing required --input-dir"))?;
    parsed.output_dir =
        output_dir.ok_or_else(|| std::io::Error::other("Missing required --output-dir"))?;
    if !env.is_empty() {
        parsed.overrides.env = Some(env);
    }
    Ok(parsed)
}

async fn run_batch_cli(args: Vec<String>) -> Result<bool, Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_run_batch_usage();
        return Ok(true);
    }
    let parsed = parse_run_batch_cli_args(args.as_slice())?;

    match execute_batch(parsed).await {
        Ok(summary) => {
            let failed = summary.failed;
            println!("{}", serde_json::to_string_pretty(&batch_outcome(summary, failed))?);
            Ok(failed == 0)
        }
        Err(err) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&failure(EnvelopeError::from(&err)))?
            );
            Ok(false)
        }
    }
}

fn resolve_cli_settings(
    settings_path: Option<&str>,
    overrides: &BatchSettingsOverlay,
) -> Result<BatchSettings, BatchError> {
    let app_root = std::env::current_dir()
        .map_err(|err| BatchError::InvalidConfig(format!("cannot resolve working directory: {err}")))?;
    let file = load_settings_file(app_root.as_path(), settings_path)?;
    let env = load_env_overlay()?;
    Ok(resolve_settings(&merge_settings_overlays(&file, &env, overrides))?)
}

async fn execute_batch(args: RunBatchCliArgs) -> Result<BatchSummary, BatchError> {
    let settings = resolve_cli_settings(args.settings_path.as_deref(), &args.overrides)?;
    let executable = settings.executable.as_deref().ok_or_else(|| {
        BatchError::InvalidConfig(String::from(
            "no executable configured; pass --executable or set INKBATCH_EXECUTABLE",
        ))
    })?;
    let executable = validate_executable(executable)?;

    let export_type = match args.format.as_deref() {
        Some(raw) => raw.parse::<ExportType>()?,
        None => ExportType::Png,
    };
    let mut command =
        InkscapeCommand::for_operation(args.operation.as_str(), export_type, &args.object_ids)?;
    if let Some(dpi) = args.dpi {
        command = command.with_dpi(dpi);
    }
    let template = command.template()?;
    let naming = match args.rename {
        Some(pattern) => OutputNaming::Pattern(pattern),
        None => OutputNaming::ChangeExtension(command.export_type().as_str().to_string()),
    };

    let selection = InputSelection::new(args.input_dir.as_path(), settings.pattern.as_str())
        .with_extensions(settings.extensions.iter().cloned())
        .recursive(settings.recursive);
    let inputs = enumerate_inputs(&selection)?;
    let jobs = plan_jobs(
        inputs.as_slice(),
        args.input_dir.as_path(),
        args.output_dir.as_path(),
        &naming,
        &template,
    )?;
    info!(
        jobs = jobs.len(),
        executable = %executable.display(),
        operation = args.operation.as_str(),
        "planned batch"
    );

    let runner = TokioProcessRunner::new().with_kill_grace(settings.kill_grace());
    let mut pool = WorkerPool::new(settings.max_workers)?
        .with_runner(Arc::new(runner))
        .with_predicate(Arc::new(settings.success.clone()));
    if settings.cache_capacity > 0 {
        pool = pool.with_cache(JobCache::new(settings.cache_capacity)?);
    }

    let mut request = BatchRequest::new(args.operation.as_str(), executable, jobs)
        .with_timeout(settings.timeout())
        .with_env(settings.env.clone())
        .overwrite(settings.overwrite)
        .with_max_input_bytes(settings.max_input_bytes());
    if let Some(cwd) = settings.working_dir.clone() {
        request = request.with_cwd(cwd);
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling batch");
                cancel.cancel();
            }
        })
    };
    let report = pool.submit(request, &cancel).await;
    interrupt.abort();
    Ok(report?.summary())
}

fn run_validate_settings_cli(args: Vec<String>) -> Result<bool, Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_validate_settings_usage();
        return Ok(true);
    }

    let mut settings_path = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--settings" => {
                let Some(value) = args.get(i + 1) else {
                    return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
                };
                settings_path = Some(value.clone());
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    match resolve_cli_settings(settings_path.as_deref(), &BatchSettingsOverlay::default()) {
        Ok(settings) => {
            println!("{}", serde_json::to_string_pretty(&success(settings))?);
            Ok(true)
        }
        Err(err) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&failure(EnvelopeError::from(&err)))?
            );
            Ok(false)
        }
    }
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  inkbatch run-batch --executable PATH --input-dir DIR --output-dir DIR [options]\n",
        "  inkbatch validate-settings [--settings PATH]\n\n",
        "Use `inkbatch <command> --help` for command options.\n"
    ));
}

fn print_run_batch_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  inkbatch run-batch --executable PATH --input-dir DIR --output-dir DIR ",
            "[--pattern GLOB] [--ext svg,svgz] [--recursive] [--overwrite] ",
            "[--max-workers N] [--timeout-secs N] [--kill-grace-ms N] [--max-input-mb N] ",
            "[--cache-capacity N] [--env KEY=VALUE]... [--action NAME] [--format EXT] ",
            "[--object-id ID]... [--dpi N] [--rename PATTERN] [--settings PATH]\n\n",
            "Defaults:\n",
            "  settings file: config/batch.settings.toml (INKBATCH_* env vars and flags override it)\n",
            "  --action export, --format png, --pattern '*', --max-workers 3, --timeout-secs 30\n",
            "  actions: export, convert, optimize, simplify, reverse, union, difference,\n",
            "           intersection, exclusion, division, object-to-path, combine, break-apart\n",
            "  --rename placeholders: {{name}}, {{ext}}, {{index}}, {{index:04d}}, {{date}}\n"
        )
    );
}

fn print_validate_settings_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  inkbatch validate-settings [--settings PATH]\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parse_run_batch_requires_directories() {
        let err = parse_run_batch_cli_args(&args(&["--input-dir", "in"]))
            .expect_err("output dir should be required");
        assert!(err.to_string().contains("--output-dir"));

        let err = parse_run_batch_cli_args(&args(&["--output-dir", "out"]))
            .expect_err("input dir should be required");
        assert!(err.to_string().contains("--input-dir"));
    }

    #[test]
    fn parse_run_batch_collects_overrides() {
        let parsed = parse_run_batch_cli_args(&args(&[
            "--executable",
            "/usr/bin/inkscape",
            "--input-dir",
            "in",
            "--output-dir",
            "out",
            "--ext",
            "svg,svgz",
            "--recursive",
            "--max-workers",
            "4",
            "--timeout-secs",
            "12",
            "--env",
            "DISPLAY=",
            "--action",
            "simplify",
            "--object-id",
            "path1",
            "--object-id",
            "path2",
            "--format",
            "svg",
        ]))
        .expect("parse should succeed");

        assert_eq!(parsed.input_dir, PathBuf::from("in"));
        assert_eq!(parsed.output_dir, PathBuf::from("out"));
        assert_eq!(parsed.overrides.executable.as_deref(), Some("/usr/bin/inkscape"));
        assert_eq!(
            parsed.overrides.extensions,
            Some(vec![String::from("svg"), String::from("svgz")])
        );
        assert_eq!(parsed.overrides.recursive, Some(true));
        assert_eq!(parsed.overrides.max_workers, Some(4));
        assert_eq!(parsed.overrides.timeout_secs, Some(12));
        assert_eq!(
            parsed.overrides.env.as_ref().and_then(|e| e.get("DISPLAY")).map(String::as_str),
            Some("")
        );
        assert_eq!(parsed.operation, "simplify");
        assert_eq!(parsed.object_ids, vec!["path1", "path2"]);
        assert_eq!(parsed.format.as_deref(), Some("svg"));
    }

    #[test]
    fn parse_run_batch_rejects_bad_values() {
        let err = parse_run_batch_cli_args(&args(&[
            "--input-dir",
            "in",
            "--output-dir",
            "out",
            "--max-workers",
            "many",
        ]))
        .expect_err("non-numeric worker count must fail");
        assert!(err.to_string().contains("--max-workers"));

        let err = parse_run_batch_cli_args(&args(&["--env", "NOVALUE"]))
            .expect_err("env without = must fail");
        assert!(err.to_string().contains("KEY=VALUE"));

        let err = parse_run_batch_cli_args(&args(&["--bogus"])).expect_err("unknown flag");
        assert!(err.to_string().contains("Unknown argument"));
    }
}
