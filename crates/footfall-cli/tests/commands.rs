//! End-to-end tests of the `footfall` binary.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

fn footfall() -> Command {
    Command::cargo_bin("footfall").unwrap()
}

#[test]
fn help_flag_shows_usage() {
    footfall()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("replay"));
}

#[test]
fn config_prints_project_overrides() {
    let project = TempDir::new().unwrap();
    fs::write(
        project.path().join("footfall.toml"),
        "[session]\nmax_age_secs = 1800\n",
    )
    .unwrap();

    footfall()
        .args(["config", "--project-dir"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("max_age_secs = 1800"))
        .stdout(predicate::str::contains("[fingerprint]"));
}

#[test]
fn replay_reports_sessions() {
    let project = TempDir::new().unwrap();
    let log = project.path().join("requests.jsonl");
    let line = |uri: &str, at: &str| {
        format!(
            r#"{{"client_id": 1, "uri": "{uri}", "remote_addr": "203.0.113.7:5000", "headers": {{"User-Agent": "{BROWSER}"}}, "at": "{at}"}}"#
        )
    };
    let lines = [
        line("/", "2024-05-02T10:00:00Z"),
        line("/pricing", "2024-05-02T10:02:00Z"),
        String::new(),
        line("/", "2024-05-02T11:00:00Z"),
    ];
    fs::write(&log, lines.join("\n")).unwrap();

    footfall()
        .args(["replay", "--sessions", "--project-dir"])
        .arg(project.path())
        .arg(&log)
        .assert()
        .success()
        .stdout(predicate::str::contains("Replayed 3 requests"))
        .stdout(predicate::str::contains("Page views:       3"))
        .stdout(predicate::str::contains("Sessions:         2"))
        .stdout(predicate::str::contains("\"page_views\":2"));
}

#[test]
fn replay_rejects_malformed_lines() {
    let project = TempDir::new().unwrap();
    let log = project.path().join("broken.jsonl");
    fs::write(&log, "{not json}\n").unwrap();

    footfall()
        .args(["replay", "--project-dir"])
        .arg(project.path())
        .arg(&log)
        .assert()
        .failure()
        .stderr(predicate::str::contains("broken.jsonl:1"));
}
