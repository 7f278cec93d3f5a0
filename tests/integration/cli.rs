use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_daemon_flags() {
    Command::cargo_bin("apollo")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--config")
                .and(predicate::str::contains("--pid-file"))
                .and(predicate::str::contains("--debug")),
        );
}

#[test]
fn version_is_reported() {
    Command::cargo_bin("apollo")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("apollo"));
}

#[test]
fn unknown_flags_are_rejected() {
    Command::cargo_bin("apollo")
        .unwrap()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--frobnicate"));
}
