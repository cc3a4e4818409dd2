//! Lock exclusion and cancellation behavior under concurrency.

mod common;

use common::{plain_repo, seeded_pair};

use beads::cancel::CancelToken;
use beads::workspace::lock::SyncLock;

#[test]
fn second_sync_fails_fast_while_lock_is_held() {
    let (_remote, a, _b) = seeded_pair();
    a.bd_ok(&["create", "hold my lock"]);

    // Hold the workspace lock as a concurrent sync would.
    let held = SyncLock::acquire(&a.root().join(".beads")).unwrap();

    let out = a.bd(&["sync"]);
    assert!(!out.status.success());
    assert_eq!(
        out.status.code(),
        Some(5),
        "SyncInProgress must map to its exit code; stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(
        String::from_utf8_lossy(&out.stderr).contains("another sync is in progress"),
    );

    drop(held);
    a.bd_ok(&["sync"]);
}

#[test]
fn flush_and_sync_fail_fast_rather_than_queue() {
    let ws = plain_repo("solo");
    let out = ws.bd(&["init", "--prefix", "px"]);
    assert!(out.status.success());
    ws.bd_ok(&["create", "queued behind nothing", "--no-auto-flush"]);

    let held = SyncLock::acquire(&ws.root().join(".beads")).unwrap();
    let start = std::time::Instant::now();
    let out = ws.bd(&["flush"]);
    assert!(!out.status.success());
    assert!(
        start.elapsed() < std::time::Duration::from_secs(2),
        "lock contention must fail fast, not block"
    );
    drop(held);
}

#[test]
fn lock_side_effects_do_not_leak_on_failure() {
    // A failed sync attempt leaves no journal change behind.
    let (_remote, a, _b) = seeded_pair();
    a.bd_ok(&["create", "stable"]);
    a.bd_ok(&["sync"]);
    let before = a.journal_bytes();

    let held = SyncLock::acquire(&a.root().join(".beads")).unwrap();
    let _ = a.bd(&["sync"]);
    drop(held);

    assert_eq!(a.journal_bytes(), before, "failed sync must not touch the journal");
}

#[test]
fn cancelled_token_rolls_back_mid_pipeline() {
    use beads::store::{NewIssue, Store};

    let mut store = Store::open_in_memory().unwrap();
    store
        .create(
            NewIssue {
                title: "cancel target".to_owned(),
                ..NewIssue::default()
            },
            "tester",
        )
        .unwrap();

    let token = CancelToken::new();
    token.cancel();
    let tmp = tempfile::TempDir::new().unwrap();
    let ws_dir = tmp.path().join(".beads");
    std::fs::create_dir_all(&ws_dir).unwrap();
    std::fs::write(ws_dir.join("issues.jsonl"), b"pristine\n").unwrap();

    let err = beads::flush::flush_locked(&mut store, &ws_dir, &token).unwrap_err();
    assert!(matches!(err, beads::BeadsError::Cancelled));
    assert_eq!(
        std::fs::read(ws_dir.join("issues.jsonl")).unwrap(),
        b"pristine\n",
        "a cancelled flush never truncates or partially writes"
    );
    assert!(store.has_dirty().unwrap(), "dirty set survives a cancelled flush");
}
