use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use boneco::{
    Args, DeviceKey, FakeAppliance, FakeHardwareClient, FanState, TerminalClient, run_with_clients,
    run_with_terminal,
};

const KEY: &str = "00112233445566778899aabbccddeeff";

struct FakeTerminal;

impl TerminalClient for FakeTerminal {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

fn config_file(test: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "boneco-it-{test}-{}.json",
        std::process::id()
    ));
    fs::write(&path, contents).expect("temp config should be writable");
    path
}

fn keyed_config(test: &str) -> PathBuf {
    config_file(test, &json!({ "device_key": KEY }).to_string())
}

fn parse(config: &Path, argv: &[&str]) -> Args {
    let config = config.to_string_lossy().into_owned();
    let mut full = vec!["boneco", "--config", config.as_str()];
    full.extend_from_slice(argv);
    Args::try_parse_from(full).expect("arguments should parse")
}

fn json_lines(out: Vec<u8>) -> Vec<Value> {
    String::from_utf8(out)
        .expect("output should be UTF-8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line should be JSON"))
        .collect()
}

fn events_named<'a>(lines: &'a [Value], name: &str) -> Vec<&'a Value> {
    lines.iter().filter(|line| line["event"] == name).collect()
}

#[tokio::test]
async fn control_reports_the_acknowledged_command() {
    let config = keyed_config("control-ok");
    let args = parse(&config, &["--output", "json", "--fake", "control", "speed", "12"]);
    let mut out = Vec::new();

    run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect("control should succeed against the fake appliance");

    let lines = json_lines(out);
    let succeeded = events_named(&lines, "command_succeeded");
    assert_eq!(1, succeeded.len());
    assert_eq!(json!({ "kind": "set_speed", "value": 12 }), succeeded[0]["command"]);
    assert!(
        events_named(&lines, "connection_changed")
            .iter()
            .any(|line| line["state"] == "ready")
    );
    assert!(lines.iter().all(|line| line["timestamp"].is_string()));
}

#[tokio::test(start_paused = true)]
async fn control_fails_when_the_appliance_never_acks() {
    let config = keyed_config("control-no-ack");
    let args = parse(
        &config,
        &[
            "--output",
            "json",
            "--fake",
            "--fake-drop-acks",
            "--ack-timeout",
            "50ms",
            "--max-retries",
            "1",
            "control",
            "power",
            "on",
        ],
    );
    let mut out = Vec::new();

    let error = run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect_err("unacknowledged command should fail");

    assert!(
        error.to_string().contains("not acknowledged after 2 attempts"),
        "unexpected error: {error:#}"
    );
    let lines = json_lines(out);
    assert_eq!(1, events_named(&lines, "command_failed").len());
}

#[tokio::test(start_paused = true)]
async fn rejected_authentication_exhausts_reconnects() {
    let config = keyed_config("control-rejected");
    let args = parse(
        &config,
        &[
            "--output",
            "json",
            "--fake",
            "--fake-reject-auth",
            "--reconnect-max-attempts",
            "0",
            "control",
            "power",
            "on",
        ],
    );
    let mut out = Vec::new();

    let error = run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect_err("rejected key should fail");

    assert!(
        error.to_string().contains("gave up reconnecting"),
        "unexpected error: {error:#}"
    );
    let lines = json_lines(out);
    assert!(events_named(&lines, "command_succeeded").is_empty());
}

#[tokio::test]
async fn listen_streams_appliance_side_changes() {
    let config = keyed_config("listen");
    let args = parse(
        &config,
        &["--output", "json", "--fake", "listen", "--max-updates", "1"],
    );
    let (command, settings) = args
        .into_command_and_settings()
        .expect("settings should resolve");
    let key = DeviceKey::parse(KEY).expect("test key should parse");
    let hardware = FakeHardwareClient::new(FakeAppliance::builder().key(key).build());
    let handle = hardware.handle();
    let mut out = Vec::new();

    let press = async {
        while !handle.is_authenticated().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.press_buttons(FanState::new(true, 9, true)).await;
    };
    let (result, ()) = tokio::join!(
        run_with_clients(command, &settings, &mut out, &FakeTerminal, &hardware),
        press
    );
    result.expect("listen should stop at the update limit");

    let lines = json_lines(out);
    let changes = events_named(&lines, "state_changed");
    assert_eq!(1, changes.len());
    assert_eq!(
        json!({ "power": true, "speed": 9, "oscillating": true }),
        changes[0]["state"]
    );
    let stopped = events_named(&lines, "stopped");
    assert_eq!(1, stopped.len());
    assert_eq!("reached_limit", stopped[0]["reason"]);
    assert_eq!(1, stopped[0]["state_updates"]);
}

#[tokio::test]
async fn listen_with_zero_limit_stops_immediately() {
    let config = keyed_config("listen-zero");
    let args = parse(
        &config,
        &["--output", "json", "--fake", "listen", "--max-updates", "0"],
    );
    let mut out = Vec::new();

    run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect("listen should stop");

    let lines = json_lines(out);
    let stopped = events_named(&lines, "stopped");
    assert_eq!(1, stopped.len());
    assert_eq!(0, stopped[0]["limit"]);
    assert_eq!(0, stopped[0]["state_updates"]);
}

#[tokio::test]
async fn config_json_redacts_the_key() {
    let config = keyed_config("config-json");
    let args = parse(
        &config,
        &["--output", "json", "--max-retries", "4", "--name", "BONECO W400", "config"],
    );
    let mut out = Vec::new();

    run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect("config should print");

    let raw = String::from_utf8(out.clone()).expect("output should be UTF-8");
    assert!(!raw.contains(KEY));
    let lines = json_lines(out);
    assert_eq!(1, lines.len());
    assert_eq!("config", lines[0]["event"]);
    assert_eq!(4, lines[0]["max_retries"]);
    assert_eq!("2s", lines[0]["ack_timeout"]);
    assert_eq!(Value::Null, lines[0]["reconnect_max_attempts"]);
    assert_eq!(8, lines[0]["key_fingerprint"].as_str().map_or(0, str::len));
    assert!(
        lines[0]["target"]
            .as_str()
            .is_some_and(|target| target.contains("BONECO W400"))
    );
}

#[tokio::test]
async fn config_pretty_lists_every_setting() {
    let config = config_file(
        "config-pretty",
        &json!({ "device_key": KEY, "ack_timeout_ms": 750, "optimistic": true }).to_string(),
    );
    let args = parse(&config, &["--output", "pretty", "config"]);
    let mut out = Vec::new();

    run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect("config should print");

    let rendered = String::from_utf8(out).expect("output should be UTF-8");
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!("Configuration:", lines[0]);
    assert_eq!(11, lines.len());
    assert!(lines.iter().any(|line| line.contains("ack_timeout") && line.contains("750ms")));
    assert!(lines.iter().any(|line| line.contains("optimistic") && line.contains("true")));
    assert!(
        lines
            .iter()
            .any(|line| line.contains("reconnect_max_attempts") && line.contains("unlimited"))
    );
}

#[tokio::test]
async fn missing_device_key_is_reported() {
    let config = config_file("no-key", "{}");
    let args = parse(&config, &["--output", "json", "config"]);
    let mut out = Vec::new();

    let error = run_with_terminal(args, &mut out, &FakeTerminal)
        .await
        .expect_err("a device key is required");

    assert!(error.to_string().contains("no device key configured"));
    assert!(out.is_empty());
}

#[test]
fn fake_only_flags_require_fake_mode() {
    let result = Args::try_parse_from(["boneco", "--fake-drop-acks", "config"]);
    assert!(result.is_err());
}

#[test]
fn address_and_name_conflict() {
    let result = Args::try_parse_from([
        "boneco", "--address", "AA:BB", "--name", "BONECO", "config",
    ]);
    assert!(result.is_err());
}
