//! CLI smoke tests for fleet.
//!
//! These tests verify argument handling and the no-active-run error
//! paths. Nothing here provisions infrastructure or opens a connection;
//! every command is pointed at an empty fleetlab home.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Get a Command for the fleet binary.
fn fleet_cmd() -> Command {
  cargo_bin_cmd!("fleet")
}

/// A command pointed at an isolated fleetlab home.
fn fleet_in(temp: &TempDir) -> Command {
  let mut cmd = fleet_cmd();
  cmd.env("FLEETLAB_HOME", temp.path());
  cmd
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  fleet_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  fleet_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("fleet"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &[
    "up", "run", "dispose", "status", "bootstrap", "start", "stop", "metrics", "console", "report",
  ] {
    fleet_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// status
// =============================================================================

#[test]
#[serial]
fn status_reports_empty_home() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("No runs yet"));
}

#[test]
#[serial]
fn status_json_on_empty_home() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("status")
    .arg("--json")
    .assert()
    .success()
    .stdout(predicate::str::contains("\"runs\": []"));
}

// =============================================================================
// run / dispose / actions without an active run
// =============================================================================

#[test]
#[serial]
fn run_without_active_run_fails() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("run")
    .assert()
    .failure()
    .stderr(predicate::str::contains("No active run"));
}

#[test]
#[serial]
fn action_without_active_run_fails() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("start")
    .assert()
    .failure()
    .stderr(predicate::str::contains("No active run"));
}

#[test]
#[serial]
fn dispose_without_active_run_fails() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("dispose")
    .arg("--force")
    .assert()
    .failure()
    .stderr(predicate::str::contains("No active run"));
}

// =============================================================================
// Argument errors
// =============================================================================

#[test]
#[serial]
fn malformed_set_override_is_rejected() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("run")
    .arg("--set")
    .arg("deploy/dir")
    .assert()
    .failure()
    .stderr(predicate::str::contains("PATH=VALUE"));
}

#[test]
#[serial]
fn unknown_model_is_rejected() {
  let temp = TempDir::new().unwrap();

  fleet_in(&temp)
    .arg("run")
    .arg("--model")
    .arg("nonesuch")
    .assert()
    .failure()
    .stderr(predicate::str::contains("nonesuch"));
}

#[test]
fn unknown_subcommand_fails() {
  fleet_cmd().arg("snapshot").assert().failure();
}
