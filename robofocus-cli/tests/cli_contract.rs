//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("robofocus")
}

/// Simulator invocation with settings kept inside `dir`.
fn sim_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env_remove("ROBOFOCUS_PORT")
        .arg("--simulator")
        .arg("--non-interactive")
        .arg("--settings")
        .arg(dir.join("settings.toml"));
    cmd
}

fn json_data(stdout: &[u8]) -> serde_json::Value {
    let parsed: serde_json::Value =
        serde_json::from_slice(stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    parsed["data"].clone()
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("robofocus"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("robofocus"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_robofocus()"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("shell"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized").or(predicate::str::contains("unknown")));
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd().arg("--invalid-flag-xyz").assert().failure().code(2);
}

#[test]
fn exit_code_two_for_missing_move_target() {
    cli_cmd()
        .arg("move")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_one_for_rejected_move() {
    let dir = tempdir().expect("tempdir should be created");
    sim_cmd(dir.path())
        .args(["move", "70000"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("out of range"));
}

#[test]
fn exit_code_three_for_invalid_simulator_config() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[simulator]\nchecksum_error_rate = 2.0\n").expect("write config");

    sim_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("position")
        .assert()
        .failure()
        .code(3);
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("posiiton")
        .assert()
        .failure()
        .stderr(predicate::str::contains("position"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("robofocus.toml"), "invalid toml [[[").expect("write config");

    let output = sim_cmd(dir.path())
        .arg("position")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn local_config_sets_simulator_start() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("robofocus.toml"),
        "[simulator]\ninitial_position = 1234\n",
    )
    .expect("write config");

    sim_cmd(dir.path())
        .arg("position")
        .assert()
        .success()
        .stdout(predicate::str::diff("1234\n"));
}

// ============================================================================
// Simulator commands
// ============================================================================

#[test]
fn position_json_uses_envelope() {
    let dir = tempdir().expect("tempdir should be created");
    let output = sim_cmd(dir.path())
        .args(["--json", "position"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    assert_eq!(json_data(&output.stdout)["position"], 0);
}

#[test]
fn move_waits_for_completion() {
    let dir = tempdir().expect("tempdir should be created");
    sim_cmd(dir.path())
        .args(["-q", "move", "150"])
        .assert()
        .success()
        .stdout(predicate::str::diff("150\n"));
}

#[test]
fn temperature_reads_simulated_sensor() {
    let dir = tempdir().expect("tempdir should be created");
    let output = sim_cmd(dir.path())
        .args(["--json", "temperature"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let celsius = json_data(&output.stdout)["temperature_celsius"]
        .as_f64()
        .expect("temperature should be a number");
    assert!((celsius - 16.8).abs() < 0.2, "{celsius}");
}

#[test]
fn backlash_is_written_and_persisted() {
    let dir = tempdir().expect("tempdir should be created");
    let output = sim_cmd(dir.path())
        .args(["--json", "backlash", "-20"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    assert_eq!(json_data(&output.stdout)["backlash"], -20);

    let saved = fs::read_to_string(dir.path().join("settings.toml")).expect("settings saved");
    assert!(saved.contains("backlash = -20"), "{saved}");
}

#[test]
fn zero_persists_offset_for_later_runs() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("robofocus.toml"),
        "[simulator]\ninitial_position = 500\n",
    )
    .expect("write config");

    sim_cmd(dir.path()).args(["-q", "zero"]).assert().success();
    sim_cmd(dir.path())
        .arg("position")
        .assert()
        .success()
        .stdout(predicate::str::diff("0\n"));
}

#[test]
fn info_json_reports_device() {
    let dir = tempdir().expect("tempdir should be created");
    let output = sim_cmd(dir.path())
        .args(["--json", "info"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let data = json_data(&output.stdout);
    assert_eq!(data["port"], "SIMULATOR");
    assert_eq!(data["firmware_version"], "002100");
    assert_eq!(data["max_travel"], 60000);
    assert_eq!(data["backlash"], 0);
}

#[test]
fn max_travel_rejects_zero() {
    let dir = tempdir().expect("tempdir should be created");
    sim_cmd(dir.path())
        .args(["max-travel", "0"])
        .assert()
        .failure()
        .code(1);
}

// ============================================================================
// Non-Interactive Mode
// ============================================================================

#[test]
fn non_interactive_env_var_is_recognized() {
    cli_cmd()
        .env("ROBOFOCUS_NON_INTERACTIVE", "1")
        .arg("--help")
        .assert()
        .success();
}
