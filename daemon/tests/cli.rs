use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("benchctld").unwrap()
}

#[test]
fn completions_writes_a_nonempty_script() {
    cli()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("benchctld"));
}

#[test]
fn config_show_prints_effective_toml() {
    cli()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("feature_constraint"));
}

#[test]
fn unknown_subcommand_fails_with_usage() {
    cli().arg("not-a-real-command").assert().failure();
}
