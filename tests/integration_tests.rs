//! CLI-level smoke tests for the ucoder binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn ucoder() -> Command {
    Command::cargo_bin("ucoder").expect("binary builds")
}

#[test]
fn test_help() {
    ucoder()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Issue-to-PR automation server"));
}

#[test]
fn test_version() {
    ucoder().arg("--version").assert().success();
}

#[test]
fn test_serve_help_lists_flags() {
    ucoder()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--db"))
        .stdout(predicate::str::contains("--dev"));
}

#[test]
fn test_unknown_subcommand_fails() {
    ucoder().arg("frobnicate").assert().failure();
}
