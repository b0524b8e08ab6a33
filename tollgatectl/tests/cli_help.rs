use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn help_text(args: &[&str]) -> String {
    let mut cmd = cargo_bin_cmd!("tollgatectl");
    let output = cmd
        .args(args)
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8_lossy(&output).into_owned()
}

/// Run against an isolated directory so no stray .env or tollgate.toml leaks in.
fn isolated(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("tollgatectl");
    cmd.current_dir(dir.path())
        .env_remove("REDIS_URL")
        .env_remove("TOLLGATE_REDIS_URL")
        .env_remove("TOLLGATE_CONFIG")
        .env_remove("TOLLGATE_QUEUE")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn top_level_help_lists_commands() {
    let text = help_text(&[]);
    for command in ["stats", "pending", "failed", "enqueue", "reap", "workers", "limit", "config"] {
        assert!(text.contains(command), "help missing '{command}'");
    }
    assert!(text.contains("--queue"), "help missing --queue");
}

#[test]
fn limit_subcommands_present() {
    let text = help_text(&["limit"]);
    assert!(text.contains("status"), "limit help missing status");
    assert!(text.contains("reset-all"), "limit help missing reset-all");
}

#[test]
fn reap_documents_watch_mode() {
    let text = help_text(&["reap"]);
    assert!(text.contains("--watch"), "reap help missing --watch");
    assert!(text.contains("--interval"), "reap help missing --interval");
}

#[test]
fn config_check_reports_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("tollgate.toml"),
        concat!(
            "[queue]\nname = \"email\"\n\n",
            "[[rate_limiters]]\nname = \"login\"\nrate = 3\nper = \"5m\"\n",
        ),
    )
    .unwrap();

    isolated(&dir)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK"))
        .stdout(predicate::str::contains("No Redis URL configured"));

    isolated(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("name = \"email\""))
        .stdout(predicate::str::contains("per = \"5m\""));
}

#[test]
fn invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("tollgate.toml"),
        "[[rate_limiters]]\nname = \"login\"\nrate = 0\nper = \"5m\"\n",
    )
    .unwrap();

    isolated(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn stats_on_in_process_store_is_empty() {
    let dir = TempDir::new().unwrap();
    isolated(&dir)
        .args(["--json", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\": 0"));
}

#[test]
fn unknown_limiter_is_rejected() {
    let dir = TempDir::new().unwrap();
    isolated(&dir)
        .args(["limit", "status", "nope", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown rate limiter 'nope'"));
}
