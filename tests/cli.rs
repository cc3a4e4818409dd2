//! CLI surface checks: flags, exit codes, and error text.

mod common;

use assert_cmd::Command;
use common::plain_repo;
use predicates::prelude::*;

fn bd_in(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("bd").expect("bd binary");
    cmd.current_dir(dir);
    cmd
}

#[test]
fn version_and_help_work_without_a_workspace() {
    let dir = tempfile::TempDir::new().unwrap();
    bd_in(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bd"));
    bd_in(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("issue tracker"));
}

#[test]
fn missing_workspace_maps_to_not_found_exit_code() {
    let dir = tempfile::TempDir::new().unwrap();
    bd_in(dir.path())
        .arg("list")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn unknown_id_and_ambiguous_prefix_have_distinct_codes() {
    let ws = plain_repo("codes");
    ws.bd_ok(&["init", "--prefix", "px"]);
    ws.bd_ok(&["create", "first of a pair"]);
    ws.bd_ok(&["create", "second of a pair"]);

    bd_in(ws.root())
        .args(["show", "px-zzzzzz99"])
        .assert()
        .failure()
        .code(2);

    // Both ids share the "px-" prefix.
    bd_in(ws.root())
        .args(["show", "px-"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("ambiguous"));
}

#[test]
fn closing_a_blocked_issue_reports_the_invariant() {
    let ws = plain_repo("blocked");
    ws.bd_ok(&["init", "--prefix", "px"]);
    let blocker = ws.bd_ok(&["create", "the blocker"]);
    let blocked = ws.bd_ok(&["create", "the blocked"]);
    ws.bd_ok(&["dep", "add", &blocked, &blocker, "--type", "blocks"]);

    bd_in(ws.root())
        .args(["close", &blocked])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("blocked"));

    bd_in(ws.root())
        .args(["close", &blocked, "--force"])
        .assert()
        .success();
}

#[test]
fn list_json_emits_parseable_output() {
    let ws = plain_repo("jsonout");
    ws.bd_ok(&["init", "--prefix", "px"]);
    ws.bd_ok(&["create", "machine readable", "-p", "0"]);

    let assert = bd_in(ws.root()).args(["list", "--json"]).assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    let issues = parsed.as_array().expect("array of issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["priority"], 0);
    assert_eq!(issues[0]["title"], "machine readable");
}

#[test]
fn ephemeral_issue_never_reaches_the_journal() {
    let ws = plain_repo("wisps");
    ws.bd_ok(&["init", "--prefix", "px"]);
    let id = ws.bd_ok(&["create", "local only wisp", "--ephemeral"]);
    ws.bd_ok(&["flush"]);

    let journal = std::fs::read_to_string(ws.root().join(".beads/issues.jsonl")).unwrap();
    assert!(!journal.contains(&id));
    assert!(!journal.contains("local only wisp"));

    // Still queryable locally.
    let listed = ws.bd_ok(&["list"]);
    assert!(listed.contains("local only wisp"));
}

#[test]
fn child_ids_come_out_hierarchical() {
    let ws = plain_repo("children");
    ws.bd_ok(&["init", "--prefix", "px"]);
    let parent = ws.bd_ok(&["create", "the epic", "-t", "epic"]);
    let child = ws.bd_ok(&["create", "first slice", "--parent", &parent]);
    assert_eq!(child, format!("{parent}.1"));
    let second = ws.bd_ok(&["create", "second slice", "--parent", &parent]);
    assert_eq!(second, format!("{parent}.2"));
}

#[test]
fn doctor_reports_ok_on_a_fresh_workspace() {
    let ws = plain_repo("healthy");
    ws.bd_ok(&["init", "--prefix", "px"]);
    ws.bd_ok(&["create", "all good"]);
    let out = ws.bd_ok(&["doctor"]);
    assert_eq!(out, "ok");
}
