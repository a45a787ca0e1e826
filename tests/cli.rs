#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn scratch() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("inkbatch_cli_")
        .tempdir()
        .expect("scratch dir should exist")
}

fn inkbatch(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_inkbatch"))
        .args(args)
        .current_dir(cwd)
        .env("RUST_LOG", "warn")
        .output()
        .expect("inkbatch should run")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(output.stdout.as_slice()).expect("stdout should be a JSON envelope")
}

// `/bin/sh` stands in for Inkscape: each input is a shell script that writes
// the file named by `--export-filename=`.
const FAKE_DOCUMENT: &str = r#"for arg in "$@"; do
  case "$arg" in
    --export-filename=*) printf exported > "${arg#--export-filename=}" ;;
  esac
done
"#;

#[test]
fn run_batch_prints_summary_envelope() {
    let dir = scratch();
    let input = dir.path().join("in");
    fs::create_dir_all(input.as_path()).unwrap();
    for name in ["a.svg", "b.svg", "notes.txt"] {
        fs::write(input.join(name), FAKE_DOCUMENT).unwrap();
    }

    let output = inkbatch(
        dir.path(),
        &[
            "run-batch",
            "--executable",
            "/bin/sh",
            "--input-dir",
            "in",
            "--output-dir",
            "out",
            "--ext",
            "svg",
            "--max-workers",
            "2",
        ],
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let json = stdout_json(&output);
    assert_eq!(json["ok"], Value::Bool(true));
    assert_eq!(json["data"]["total"], 2);
    assert_eq!(json["data"]["successful"], 2);
    assert_eq!(json["data"]["success_rate"], 100.0);
    assert_eq!(fs::read_to_string(dir.path().join("out/a.png")).unwrap(), "exported");
    assert_eq!(fs::read_to_string(dir.path().join("out/b.png")).unwrap(), "exported");
}

#[test]
fn run_batch_reports_empty_input_as_invalid_input() {
    let dir = scratch();
    fs::create_dir_all(dir.path().join("in")).unwrap();

    let output = inkbatch(
        dir.path(),
        &[
            "run-batch",
            "--executable",
            "/bin/sh",
            "--input-dir",
            "in",
            "--output-dir",
            "out",
        ],
    );

    assert!(!output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["ok"], Value::Bool(false));
    assert_eq!(json["error"]["code"], "invalid_input");
    assert!(json.get("data").is_none());
}

#[test]
fn run_batch_rejects_relative_executable() {
    let dir = scratch();
    fs::create_dir_all(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.svg"), FAKE_DOCUMENT).unwrap();

    let output = inkbatch(
        dir.path(),
        &[
            "run-batch",
            "--executable",
            "inkscape",
            "--input-dir",
            "in",
            "--output-dir",
            "out",
        ],
    );

    assert!(!output.status.success());
    assert_eq!(stdout_json(&output)["error"]["code"], "executable_not_found");
}

#[test]
fn validate_settings_reads_config_file() {
    let dir = scratch();
    fs::create_dir_all(dir.path().join("config")).unwrap();
    fs::write(
        dir.path().join("config/batch.settings.toml"),
        "[batch]\nmax_workers = 5\nextensions = [\"svg\"]\n",
    )
    .unwrap();

    let output = inkbatch(dir.path(), &["validate-settings"]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["data"]["max_workers"], 5);
    assert_eq!(json["data"]["timeout_secs"], 30);
    assert_eq!(json["data"]["success"]["kind"], "exit_code_zero");

    fs::write(
        dir.path().join("config/batch.settings.toml"),
        "[batch]\nmax_workers = 0\n",
    )
    .unwrap();
    let output = inkbatch(dir.path(), &["validate-settings"]);
    assert!(!output.status.success());
    assert_eq!(stdout_json(&output)["error"]["code"], "invalid_config");
}
