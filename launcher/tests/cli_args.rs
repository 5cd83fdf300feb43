//! CLI tests for the `launch` binary.
//!
//! Only invocations that fail before any provider call are exercised here.

use std::fs;
use std::process::Command;

use launcher::exit_codes;

#[test]
fn missing_config_file_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = Command::new(env!("CARGO_BIN_EXE_launch"))
        .current_dir(temp.path())
        .args(["-c", "nope.toml"])
        .output()
        .expect("launch");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.toml"));
    assert!(output.stdout.is_empty());
}

#[test]
fn malformed_launcher_table_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("launch.toml"),
        "[launcher]\ninstance_poll_attempts = 0\n",
    )
    .expect("write config");

    let status = Command::new(env!("CARGO_BIN_EXE_launch"))
        .current_dir(temp.path())
        .args(["--config", "launch.toml"])
        .status()
        .expect("launch");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn missing_config_flag_is_a_usage_error() {
    let status = Command::new(env!("CARGO_BIN_EXE_launch"))
        .status()
        .expect("launch");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
