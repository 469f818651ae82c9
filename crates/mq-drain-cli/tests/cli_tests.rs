//! CLI integration tests for mq-drain.
//!
//! These tests verify command-line argument parsing, configuration
//! resolution and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the mq-drain binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("mq-drain").unwrap();
    // Keep host environment out of the fallback chain.
    for var in [
        "MQ_SOURCE_URL",
        "MQ_TARGET_URL",
        "MQ_USER",
        "MQ_PASSWORD",
        "MQ_MIGRATE_SUBSCRIPTIONS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("discover"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mq-drain"));
}

#[test]
fn test_missing_source_url_fails_with_config_error() {
    cmd()
        .args(["run"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("source broker url"));
}

#[test]
fn test_missing_target_url_fails_with_config_error() {
    cmd()
        .args(["--source-url", "mem://a", "run"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("target broker url"));
}

#[test]
fn test_unknown_scheme_is_rejected() {
    cmd()
        .args(["--source-url", "tcp://a", "--target-url", "tcp://b", "run"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no broker driver"));
}

#[test]
fn test_same_source_and_target_rejected() {
    cmd()
        .args(["--source-url", "mem://a", "--target-url", "mem://a", "run"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("must differ"));
}

#[test]
fn test_env_vars_supply_urls() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .env("MQ_SOURCE_URL", "mem://a")
        .env("MQ_TARGET_URL", "mem://b")
        .args(["--recovery-dir"])
        .arg(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Migration completed"));
}

#[test]
fn test_run_with_empty_brokers_reports_zero_messages() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args(["--source-url", "mem://a", "--target-url", "mem://b"])
        .args(["--recovery-dir"])
        .arg(dir.path())
        .args(["--output-json", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"messages_transferred\": 0"))
        .stdout(predicate::str::contains("\"status\": \"completed\""));
}

#[test]
fn test_check_reports_broker_health() {
    cmd()
        .args(["--source-url", "mem://a", "--target-url", "mem://b", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("source broker [mem://a]: ok"))
        .stdout(predicate::str::contains("target broker [mem://b]: ok"));
}

#[test]
fn test_discover_on_empty_broker_succeeds() {
    cmd()
        .args([
            "--source-url",
            "mem://a",
            "--target-url",
            "mem://b",
            "discover",
        ])
        .assert()
        .success();
}

#[test]
fn test_config_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("drain.yaml");
    std::fs::write(
        &config_path,
        format!(
            "source:\n  url: mem://a\ntarget:\n  url: mem://b\nrecovery:\n  store_dir: {}\n",
            dir.path().join("recovery").display()
        ),
    )
    .unwrap();

    cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Migration completed"));
}

#[test]
fn test_invalid_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("drain.yaml");
    std::fs::write(&config_path, "source: [not, a, mapping]\n").unwrap();

    cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_unknown_log_format_rejected() {
    cmd()
        .args(["--source-url", "mem://a", "--target-url", "mem://b"])
        .args(["--log-format", "xml", "run"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown log format"));
}
