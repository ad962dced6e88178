//! End-to-end tests for the journal and config commands.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn project() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("arcvault.toml"),
        "[journal]\nmin_space_left = 0\nmin_space_required_after_write = 0\n",
    )
    .unwrap();
    temp
}

fn arcvault(project: &Path) -> Command {
    let mut cmd = Command::cargo_bin("arcvault").unwrap();
    cmd.arg("--project").arg(project).env_remove("RUST_LOG");
    cmd
}

#[test]
fn upload_then_checksum() {
    let temp = project();
    let file = temp.path().join("capture.arc");
    fs::write(&file, "archived bytes").unwrap();

    arcvault(temp.path())
        .args(["journal", "upload"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("capture.arc##"));

    arcvault(temp.path())
        .args(["journal", "checksum", "capture.arc"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("^[0-9a-f]{64}\n$").unwrap());
}

#[test]
fn upload_with_explicit_name_and_list() {
    let temp = project();
    let file = temp.path().join("local-copy");
    fs::write(&file, "content").unwrap();

    arcvault(temp.path())
        .args(["journal", "upload", "--name", "renamed.arc"])
        .arg(&file)
        .assert()
        .success();

    arcvault(temp.path())
        .args(["journal", "list"])
        .assert()
        .success()
        .stdout("renamed.arc\n");

    arcvault(temp.path())
        .args(["journal", "list", "--checksums"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("renamed.arc##"));
}

#[test]
fn conflicting_upload_fails() {
    let temp = project();
    let first = temp.path().join("first");
    let second = temp.path().join("second");
    fs::write(&first, "one").unwrap();
    fs::write(&second, "two").unwrap();

    arcvault(temp.path())
        .args(["journal", "upload", "--name", "a.arc"])
        .arg(&first)
        .assert()
        .success();

    arcvault(temp.path())
        .args(["journal", "upload", "--name", "a.arc"])
        .arg(&second)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to upload a.arc"));
}

#[test]
fn correct_moves_old_entry_to_wrong_entries() {
    let temp = project();
    let bad = temp.path().join("bad");
    let good = temp.path().join("good");
    fs::write(&bad, "ERROR!").unwrap();
    fs::write(&good, "the real thing").unwrap();

    arcvault(temp.path())
        .args(["journal", "upload", "--name", "a.arc"])
        .arg(&bad)
        .assert()
        .success();

    arcvault(temp.path())
        .args(["journal", "correct", "a.arc"])
        .arg(&good)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Corrected a.arc"));

    arcvault(temp.path())
        .args(["journal", "wrong-entries"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("a.arc##"));

    arcvault(temp.path())
        .args(["journal", "history", "a.arc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("UPLOAD_COMPLETED"));
}

#[test]
fn checksum_of_unknown_file_fails() {
    let temp = project();
    arcvault(temp.path())
        .args(["journal", "checksum", "missing.arc"])
        .assert()
        .failure();
}

#[test]
fn config_show_formats() {
    let temp = project();

    arcvault(temp.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Upload retry limit: 3"));

    arcvault(temp.path())
        .args(["config", "show", "--format", "toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[heartbeat]"));

    arcvault(temp.path())
        .args(["config", "show", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"upload_retry_limit\": 3"));
}

#[test]
fn config_validate_rejects_bad_heartbeat() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("arcvault.toml"),
        "[heartbeat]\ninterval_ms = 1000\nacceptable_delay_ms = 500\n",
    )
    .unwrap();

    arcvault(temp.path())
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("validation failed"));
}
