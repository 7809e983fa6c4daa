//! Smoke tests -- verify the binary runs and key subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn flowwatch(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("flowwatch").unwrap();
    cmd.env("FLOWWATCH_CONFIG", config).env_remove("RUST_LOG");
    cmd
}

/// Config pointing the store into `dir`, with the offline reasoning service.
fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("flowwatch.toml");
    let db = dir.path().join("anomalies.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\n\n[model]\nn_estimators = 50\n\n[explain]\nprovider = \"local\"\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("flowwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Network anomaly scoring"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("flowwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("flowwatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "detect", "history", "export"] {
        Command::cargo_bin("flowwatch")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_history_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    flowwatch(&config)
        .args(["history", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No anomalies recorded."));
}

#[test]
fn test_detect_simulated_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    flowwatch(&config)
        .args(["detect", "--simulate", "--offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Received:              110"));

    let out = dir.path().join("anomalies.csv");
    flowwatch(&config)
        .args(["export", "--output"])
        .arg(&out)
        .assert()
        .success();
    let csv = std::fs::read_to_string(&out).unwrap();
    assert!(csv.starts_with("id,timestamp,source_address,packet_size,response_time,status,explanation"));
    assert!(csv.lines().count() > 1, "simulated attack traffic should be flagged");
}

#[test]
fn test_detect_feed_from_stdin_skips_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    flowwatch(&config)
        .args(["detect", "--feed", "-", "--offline"])
        .write_stdin(
            "{\"source_address\":\"999.999.1.1\",\"packet_size\":900,\"response_time\":900}\nnot json\n{\"source_address\":\"192.168.1.4\",\"packet_size\":50,\"response_time\":50}\n",
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("Received:              2"))
        .stdout(predicate::str::contains("address 1"));
}
