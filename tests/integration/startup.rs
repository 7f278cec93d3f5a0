use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn apollo() -> Command {
    Command::cargo_bin("apollo").unwrap()
}

#[test]
fn missing_config_file_is_fatal() {
    let dir = tempdir().unwrap();
    apollo()
        .args([
            "--config",
            "/nonexistent/apollo.yaml",
            "--pid-file",
            &dir.path().join("apollo.pid").to_string_lossy(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn missing_mandatory_key_is_fatal() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "service_name: www\nhostname: w01\n").unwrap();

    apollo()
        .args([
            "--config",
            &config_path.to_string_lossy(),
            "--pid-file",
            &dir.path().join("apollo.pid").to_string_lossy(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("colo"));
}

#[test]
fn unknown_config_keys_are_fatal() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(
        &config_path,
        "service_name: www\nhostname: w01\ncolo: dc1\nthresholddown: 3\n",
    )
    .unwrap();

    apollo()
        .args([
            "--config",
            &config_path.to_string_lossy(),
            "--pid-file",
            &dir.path().join("apollo.pid").to_string_lossy(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("thresholddown"));
}

#[test]
fn second_instance_is_refused() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "service_name: www\nhostname: w01\ncolo: dc1\n").unwrap();

    // The test process itself plays the live instance.
    let pid_path = dir.path().join("apollo.pid");
    fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();

    apollo()
        .args([
            "--config",
            &config_path.to_string_lossy(),
            "--pid-file",
            &pid_path.to_string_lossy(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already running"));
}
