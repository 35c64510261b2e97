//! CLI test cases.
//!
//! These use the plain-text recognizer and the built-in grammar rules, so they
//! don't need `tesseract` or any network services.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("batch-proofer").unwrap();
    cmd.env_remove("BACKEND_URL").env_remove("LANGUAGETOOL_URL");
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_run_text_files_to_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.jsonl");
    cmd()
        .arg("run")
        .arg("tests/fixtures/texts/cat.txt")
        .arg("tests/fixtures/texts/fine.txt")
        .args(["--engine", "plain", "--grammar", "rules", "--auto-correct"])
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let output = std::fs::read_to_string(&out).unwrap();
    let rows = output
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(rows.len(), 2);
    let cat = rows.iter().find(|row| row["name"] == "cat.txt").unwrap();
    assert_eq!(
        cat["corrected_text"].as_str().unwrap().trim_end(),
        "The cat sat on the mat."
    );
    assert!(cat["grammar_error_count"].as_u64().unwrap() >= 3);
}

#[test]
fn test_run_input_list_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    cmd()
        .arg("run")
        .args(["--input", "tests/fixtures/texts/input.csv"])
        .arg("--sequential")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let output = std::fs::read_to_string(&out).unwrap();
    assert!(output.starts_with("timestamp,name,status,"));
    assert!(output.contains("fine.txt"));
    assert!(output.contains("cat.txt"));
}

#[test]
fn test_run_to_stdout() {
    cmd()
        .arg("run")
        .arg("tests/fixtures/texts/fine.txt")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\":\"fine.txt\""));
}

#[test]
fn test_missing_file_exceeds_failure_rate() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .arg("run")
        .arg("tests/fixtures/texts/fine.txt")
        .arg(dir.path().join("missing.txt"))
        .arg("--no-auto-retry")
        .arg("-o")
        .arg(dir.path().join("out.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("of files failed"));
}

#[test]
fn test_missing_file_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.jsonl");
    cmd()
        .arg("run")
        .arg("tests/fixtures/texts/fine.txt")
        .arg(dir.path().join("missing.txt"))
        .args(["--max-retries", "1", "--retry-delay", "0"])
        .args(["--allowed-failure-rate", "0.5", "--include-failed"])
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let output = std::fs::read_to_string(&out).unwrap();
    assert_eq!(output.lines().count(), 2);
    assert!(output.contains("Maximum retries exceeded"));
}

#[test]
fn test_no_inputs() {
    cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no input files"));
}

#[test]
fn test_schema() {
    cmd()
        .args(["schema", "Settings"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retries"));
    cmd()
        .args(["schema", "ExportRecord"])
        .assert()
        .success()
        .stdout(predicate::str::contains("corrected_text"));
}
