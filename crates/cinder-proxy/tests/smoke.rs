//! Smoke tests for the `cinder` binary.
//!
//! Exercises the CLI surface and a bare MCP handshake against the simulated
//! engine, so no live engine is needed.

use std::io::Write;
use std::process::{Command, Stdio};

fn cinder() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cinder"))
}

// ── Help / basic CLI ──────────────────────────────────────────────────────────

#[test]
fn binary_responds_to_help() {
    let output = cinder().arg("--help").output().expect("failed to execute cinder");
    assert!(output.status.success(), "cinder --help should exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Cinder"), "help output should mention Cinder");
    assert!(stdout.contains("serve"), "help output should list serve subcommand");
    assert!(stdout.contains("tools"), "help output should list tools subcommand");
    assert!(stdout.contains("sim-engine"), "help output should list sim-engine subcommand");
}

#[test]
fn serve_help_documents_flags() {
    let output = cinder()
        .args(["serve", "--help"])
        .output()
        .expect("failed to execute cinder serve --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--engine-url"));
    assert!(stdout.contains("--simulate"));
}

#[test]
fn unknown_subcommand_fails() {
    let output = cinder()
        .arg("frobnicate")
        .output()
        .expect("failed to execute cinder frobnicate");
    assert!(!output.status.success(), "unknown subcommand should exit non-zero");
}

// ── Tool catalogue ───────────────────────────────────────────────────────────

#[test]
fn tools_prints_the_catalogue() {
    let output = cinder().arg("tools").output().expect("failed to execute cinder tools");
    assert!(output.status.success());
    let tools: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("tools output should be JSON");
    let tools = tools.as_array().expect("tools output should be an array");
    assert!(tools.len() > 40, "expected the full catalogue, got {}", tools.len());
    assert!(tools.iter().any(|t| t["name"] == "batch"));
    assert!(tools.iter().any(|t| t["name"] == "start-cook"));
}

// ── Serve ────────────────────────────────────────────────────────────────────

#[test]
fn serve_with_missing_config_fails_cleanly() {
    let output = cinder()
        .args(["serve", "--config", "/nonexistent/cinder.toml"])
        .stdin(Stdio::null())
        .output()
        .expect("failed to execute cinder serve");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config"), "stderr should mention the config: {stderr}");
}

#[test]
fn serve_rejects_non_http_engine_url() {
    let output = cinder()
        .args(["serve", "--simulate", "--engine-url", "ftp://engine"])
        .stdin(Stdio::null())
        .output()
        .expect("failed to execute cinder serve");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("base_url"), "stderr should name the bad field: {stderr}");
}

#[test]
fn simulated_serve_answers_initialize() {
    let mut child = cinder()
        .args(["serve", "--simulate"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn cinder serve");

    let initialize = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "smoke", "version": "0.0.0"}
        }
    });
    {
        let mut stdin = child.stdin.take().expect("stdin is piped");
        writeln!(stdin, "{initialize}").expect("failed to write initialize");
    }

    let output = child.wait_with_output().expect("failed to wait for cinder");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("protocolVersion"),
        "initialize should be answered: {stdout}"
    );
}
