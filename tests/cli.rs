//! Binary surface checks: help text and the not-a-repository failure.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_core_flags() {
    let mut cmd = Command::cargo_bin("pup").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--diff"))
        .stdout(predicate::str::contains("--pr-diff"))
        .stdout(predicate::str::contains("--exclude"))
        .stdout(predicate::str::contains("--auto-context"));
}

#[test]
fn outside_a_repository_fails_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("pup").unwrap();
    cmd.arg("--cwd")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("git repository"));
}
