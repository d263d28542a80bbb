//! Smoke tests -- verify the binary runs and its subcommands parse.

use assert_cmd::Command;
use predicates::prelude::*;

fn testfleet() -> Command {
    let mut cmd = Command::cargo_bin("testfleet").unwrap();
    cmd.env_remove("TESTFLEET_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    testfleet()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Execution dispatch and result judgment"));
}

#[test]
fn test_cli_version() {
    testfleet()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("testfleet"));
}

#[test]
fn test_execution_subcommands_exist() {
    for sub in [
        "submit", "start", "stop", "threads", "delete", "show", "result",
    ] {
        testfleet()
            .args(["execution", sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_node_subcommands_exist() {
    for sub in ["register", "heartbeat", "enable", "disable", "list"] {
        testfleet().args(["node", sub, "--help"]).assert().success();
    }
}

#[test]
fn test_config_show_prints_defaults() {
    testfleet()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[dispatch]"))
        .stdout(predicate::str::contains("lock_ttl_secs = 120"));
}

#[test]
fn test_config_show_reads_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("testfleet.toml");
    std::fs::write(&path, "[quotas]\nmax_concurrent_executions = 3\n").unwrap();

    testfleet()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_executions = 3"));
}

#[test]
fn test_missing_config_file_fails() {
    testfleet()
        .args(["--config", "/nonexistent/testfleet.toml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_submit_rejects_bad_json() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("exec.json");
    std::fs::write(&path, "{ not json").unwrap();

    testfleet()
        .args(["execution", "submit", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid execution JSON"));
}
