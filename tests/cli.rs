//! Binary-level checks.

#![allow(clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn searchlight() -> Command {
    let mut cmd = Command::cargo_bin("searchlight").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("OPENAI_API_KEY")
        .env_remove("SEARCHLIGHT_BASE_URL")
        .env_remove("SEARCHLIGHT_MODEL");
    cmd
}

#[test]
fn test_serves_until_stdin_closes() {
    let input = concat!(
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        "\n",
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        "\n",
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        "\n",
    );

    searchlight()
        .env("SEARCHLIGHT_API_KEY", "dummy")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""protocolVersion":"2024-11-05""#))
        .stdout(predicate::str::contains(r#""name":"search""#));
}

#[test]
fn test_stdout_carries_only_protocol_lines() {
    let output = searchlight()
        .env("SEARCHLIGHT_API_KEY", "dummy")
        .arg("-vv")
        .write_stdin("{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"ping\"}\n")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);
    let pong: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(pong["id"], 9);
    assert!(!output.stderr.is_empty());
}

#[test]
fn test_missing_api_key_fails() {
    searchlight()
        .env_remove("SEARCHLIGHT_API_KEY")
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key"));
}

#[test]
fn test_rejects_bad_setting() {
    searchlight()
        .env("SEARCHLIGHT_API_KEY", "dummy")
        .env("SEARCHLIGHT_BASE_URL", "ftp://example.com")
        .write_stdin("")
        .assert()
        .failure();
}

#[test]
fn test_version_flag() {
    searchlight()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
