use assert_cmd::Command;
use predicates::prelude::*;

fn ipd() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("ipd").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    ipd().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    ipd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ipd"));
}

#[test]
fn test_help_mentions_config_flag() {
    let assert = ipd().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(output.contains("--config"));
}

#[test]
fn test_missing_config_fails() {
    ipd()
        .args(["--config", "/nonexistent/ipd.toml"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_flag_fails() {
    ipd()
        .arg("--nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}
