//! CLI integration tests for migrate-db.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::TempDir;

/// Get a command for the migrate-db binary.
fn cmd() -> Command {
    Command::cargo_bin("migrate-db").unwrap()
}

/// A directory holding the starter configuration written by `init`.
fn initialized_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    cmd().current_dir(dir.path()).arg("init").assert().success();
    dir
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("migrate-db"));
}

#[test]
fn test_global_flags_listed() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"));
}

#[test]
fn test_init_subcommand_help() {
    cmd()
        .args(["init", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--output"))
        .stdout(predicate::str::contains("--force"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

// =============================================================================
// Init Tests
// =============================================================================

#[test]
fn test_init_writes_template() {
    let dir = initialized_dir();
    let content = std::fs::read_to_string(dir.path().join("migrate.yaml")).unwrap();
    assert!(content.contains("connection_string"));
    assert!(content.contains("checkpoint_file: tables.txt"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = initialized_dir();
    cmd()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_init_force_overwrites() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.yaml");
    std::fs::write(&path, "stale").unwrap();

    cmd()
        .args(["init", "--force", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert!(std::fs::read_to_string(&path).unwrap().contains("source:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["--config", "/nonexistent/migrate.yaml", "run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: [unclosed").unwrap();

    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("status")
        .assert()
        .code(2);
}

#[test]
fn test_missing_required_fields_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:\n  connection_string: \"Server=localhost\"").unwrap();

    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("status")
        .assert()
        .code(2);
}

#[test]
fn test_zero_connections_rejected() {
    let dir = initialized_dir();
    let path = dir.path().join("migrate.yaml");
    let content = std::fs::read_to_string(&path)
        .unwrap()
        .replace("max_connections: 100", "max_connections: 0");
    std::fs::write(&path, content).unwrap();

    cmd()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("max_connections"));
}

#[test]
fn test_unknown_log_format_rejected() {
    let dir = initialized_dir();
    cmd()
        .current_dir(dir.path())
        .args(["--log-format", "xml", "status"])
        .assert()
        .code(2);
}

// =============================================================================
// Status Tests
// =============================================================================

#[test]
fn test_status_without_records() {
    let dir = initialized_dir();
    cmd()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no tables recorded"))
        .stdout(predicate::str::contains("none"));
}

#[test]
fn test_status_lists_checkpoint_as_json() {
    let dir = initialized_dir();
    std::fs::write(dir.path().join("tables.txt"), "customers\norders\n").unwrap();
    std::fs::write(
        dir.path().join("after_script.txt"),
        "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"fk\" FOREIGN KEY (\"c\") REFERENCES \"public\".\"customers\" (\"id\");\n",
    )
    .unwrap();

    let output = cmd()
        .current_dir(dir.path())
        .args(["--output-json", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["checkpointed_tables"], serde_json::json!(["customers", "orders"]));
    assert_eq!(state["restore_script_pending"], true);
}
