use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO"));
    command
        .arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("rootless-pull-cli")
        .arg("--");
    command
}

#[test]
fn cli_no_args() {
    cli()
        .assert()
        .failure()
        .stderr(predicate::str::contains("USAGE:"))
        .stdout(predicate::str::is_empty());
}

#[test]
fn cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SUBCOMMANDS:"))
        .stdout(predicate::str::contains("pull"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn cli_pull_invalid_reference() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("--state-dir")
        .arg(dir.path())
        .arg("pull")
        .arg("Alpine")
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("invalid image reference"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn cli_df_empty() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("-l")
        .arg("error")
        .arg("--state-dir")
        .arg(dir.path())
        .arg("df")
        .assert()
        .success()
        .stdout(predicate::str::contains("Images: 0\n"))
        .stdout(predicate::str::contains("Chains: 0\n"))
        .stderr(predicate::str::is_empty());
}
