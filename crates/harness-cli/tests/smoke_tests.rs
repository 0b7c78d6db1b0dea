//! Smoke tests for the testem-harness binary

#![allow(deprecated)] // Allow deprecated Command::cargo_bin until assert_cmd is updated
#![allow(clippy::expect_used, clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a command for the testem-harness binary
fn harness() -> Command {
    let mut cmd = Command::cargo_bin("testem-harness").expect("testem-harness binary should exist");
    cmd.env_remove("TESTEM_HARNESS_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn project(dir: &TempDir) -> std::path::PathBuf {
    fs::create_dir_all(dir.path().join("app/tests")).unwrap();
    fs::create_dir_all(dir.path().join("app/src")).unwrap();
    let config = dir.path().join("testem-harness.yaml");
    fs::write(
        &config,
        "coverage_port: 7411\n\
         source_dirs:\n  src: app/src\n\
         content_dirs:\n  tests: app/tests\n\
         additional_proxies:\n  - /api\n",
    )
    .unwrap();
    config
}

// ============================================================================
// Basic CLI Tests
// ============================================================================

#[test]
fn test_version_flag() {
    harness()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.4.0"));
}

#[test]
fn test_help_flag() {
    harness()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("proxies"));
}

#[test]
fn test_no_args_fails() {
    harness().assert().failure();
}

#[test]
fn test_run_without_command_fails() {
    harness().arg("run").assert().failure();
}

// ============================================================================
// Subcommands
// ============================================================================

#[test]
fn test_missing_config_reports_error() {
    let dir = TempDir::new().unwrap();
    harness()
        .current_dir(dir.path())
        .arg("proxies")
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn test_proxies_prints_table() {
    let dir = TempDir::new().unwrap();
    let config = project(&dir);
    harness()
        .arg("proxies")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"/coverage\""))
        .stdout(predicate::str::contains("\"/tests\""))
        .stdout(predicate::str::contains("\"/api\""))
        .stdout(predicate::str::contains("http://127.0.0.1:7411"));
}

#[test]
fn test_proxies_writes_file() {
    let dir = TempDir::new().unwrap();
    let config = project(&dir);
    let out = dir.path().join("out/proxies.json");
    harness()
        .env("TESTEM_HARNESS_CONFIG", &config)
        .args(["-q", "proxies", "--output"])
        .arg(&out)
        .assert()
        .success();
    let table: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert!(table.get("/src").is_some());
}

#[test]
fn test_report_summarizes_coverage_dir() {
    let dir = TempDir::new().unwrap();
    let coverage = dir.path().join("coverage");
    fs::create_dir_all(&coverage).unwrap();
    fs::write(
        coverage.join("coverage-chrome-91-foo.html-a-1.json"),
        r#"{"/app/src/math.js": {"s": {"0": 1, "1": 0}, "f": {}, "b": {},
            "statementMap": {"0": {"start": {"line": 1}}, "1": {"start": {"line": 2}}}}}"#,
    )
    .unwrap();
    let reports = dir.path().join("reports");

    harness()
        .arg("report")
        .arg("--coverage-dir")
        .arg(&coverage)
        .arg("--reports-dir")
        .arg(&reports)
        .assert()
        .success()
        .stdout(predicate::str::contains("math.js"));
    assert!(reports.join("coverage-summary.json").is_file());
}

#[test]
fn test_report_missing_dir_fails() {
    let dir = TempDir::new().unwrap();
    harness()
        .args(["report", "--coverage-dir"])
        .arg(dir.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("coverage directory not found"));
}
