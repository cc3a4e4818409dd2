//! End-to-end sync scenarios over real git remotes and two clones.

mod common;

use std::time::Duration;

use common::{TestClone, plain_repo, seeded_pair};

fn sleep_clock_tick() {
    // Wall-clock ordering between clones' edits; updated_at has
    // nanosecond precision, so a short sleep is plenty.
    std::thread::sleep(Duration::from_millis(20));
}

fn journal_hash(clone: &TestClone) -> String {
    beads::journal::hash_hex(&clone.journal_bytes())
}

// ---------------------------------------------------------------------------
// Scenario: fast-forward pull
// ---------------------------------------------------------------------------

#[test]
fn fast_forward_pull_converges_fields_and_hashes() {
    let (_remote, a, b) = seeded_pair();

    let id = a.bd_ok(&["create", "Fix login", "-p", "2"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    let shown = b.bd_ok(&["show", &id]);
    assert!(shown.contains("Fix login"));
    assert!(shown.contains("priority: 2"));
    assert_eq!(journal_hash(&a), journal_hash(&b));
}

// ---------------------------------------------------------------------------
// Scenario: concurrent edits of different fields
// ---------------------------------------------------------------------------

#[test]
fn concurrent_scalar_edits_resolve_record_level_lww() {
    let (_remote, a, b) = seeded_pair();
    let id = a.bd_ok(&["create", "Concurrent edit", "-p", "2"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    // A edits the title first; B edits the priority strictly later.
    a.bd_ok(&["update", &id, "--title", "Title from A"]);
    a.bd_ok(&["sync"]);
    sleep_clock_tick();
    b.bd_ok(&["update", &id, "-p", "0"]);
    b.bd_ok(&["sync"]);
    a.bd_ok(&["sync"]);

    // Record-level LWW: B's whole record wins, so A's title edit is lost.
    for clone in [&a, &b] {
        let shown = clone.bd_ok(&["show", &id]);
        assert!(
            shown.contains("Concurrent edit"),
            "title should be the base one: {shown}"
        );
        assert!(!shown.contains("Title from A"));
        assert!(shown.contains("priority: 0"));
    }
    assert_eq!(journal_hash(&a), journal_hash(&b));
}

// ---------------------------------------------------------------------------
// Scenario: dependency deletion race
// ---------------------------------------------------------------------------

#[test]
fn dependency_deletion_beats_concurrent_addition() {
    let (_remote, a, b) = seeded_pair();
    let two = a.bd_ok(&["create", "issue two"]);
    let three = a.bd_ok(&["create", "issue three"]);
    let four = a.bd_ok(&["create", "issue four"]);
    a.bd_ok(&["dep", "add", &three, &two, "--type", "blocks"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    a.bd_ok(&["dep", "remove", &three, &two, "--type", "blocks"]);
    a.bd_ok(&["sync"]);
    sleep_clock_tick();
    b.bd_ok(&["dep", "add", &three, &four, "--type", "blocks"]);
    b.bd_ok(&["sync"]);
    a.bd_ok(&["sync"]);

    for clone in [&a, &b] {
        let shown = clone.bd_ok(&["show", &three]);
        assert!(
            shown.contains(&format!("dep: blocks {four}")),
            "added edge must survive: {shown}"
        );
        assert!(
            !shown.contains(&format!("dep: blocks {two}")),
            "removed edge must stay removed: {shown}"
        );
    }
    assert_eq!(journal_hash(&a), journal_hash(&b));
}

// ---------------------------------------------------------------------------
// Scenario: tombstone anti-resurrection
// ---------------------------------------------------------------------------

#[test]
fn tombstone_survives_concurrent_offline_edit() {
    let (_remote, a, b) = seeded_pair();
    let id = a.bd_ok(&["create", "doomed issue"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    // B modifies while offline at T0; A deletes at T1 > T0.
    b.bd_ok(&["update", &id, "--notes", "offline edit"]);
    sleep_clock_tick();
    a.bd_ok(&["delete", &id, "--reason", "superseded"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);
    a.bd_ok(&["sync"]);

    for clone in [&a, &b] {
        let out = clone.bd(&["show", &id]);
        assert!(
            !out.status.success(),
            "deleted issue must not resolve on {:?}",
            clone.root()
        );
        let journal = String::from_utf8_lossy(&clone.journal_bytes()).to_string();
        assert!(
            journal.contains("deleted_at"),
            "tombstone must stay in the journal: {journal}"
        );
        assert!(!journal.contains("offline edit"));
    }
    assert_eq!(journal_hash(&a), journal_hash(&b));
}

// ---------------------------------------------------------------------------
// Scenario: external workspace
// ---------------------------------------------------------------------------

#[test]
fn external_workspace_commits_land_in_the_other_repo() {
    // The tracking repo owns .beads; the caller works in an unrelated
    // project.
    let tracker = plain_repo("tracker");
    let out = tracker.bd(&["init", "--prefix", "px"]);
    assert!(out.status.success());

    let caller = plain_repo("caller");
    std::fs::write(caller.root().join("app.txt"), "unrelated\n").unwrap();
    caller.git(&["add", "-A"]);
    caller.git(&["commit", "-m", "caller baseline"]);

    let beads_dir = tracker.root().join(".beads");
    let env: &[(&str, &str)] = &[("BEADS_DIR", beads_dir.to_str().unwrap())];

    let created = caller.bd_with_env(&["create", "tracked elsewhere"], env);
    assert!(
        created.status.success(),
        "create via BEADS_DIR failed: {}",
        String::from_utf8_lossy(&created.stderr)
    );
    let synced = caller.bd_with_env(&["sync"], env);
    assert!(
        synced.status.success(),
        "sync via BEADS_DIR failed: {}",
        String::from_utf8_lossy(&synced.stderr)
    );

    // The caller's repo saw nothing beads-related.
    assert_eq!(caller.git(&["status", "--porcelain"]), "");
    // The tracker repo received the sync commit.
    let log = tracker.git(&["log", "--oneline"]);
    assert!(log.contains("chore(beads): sync"), "{log}");
    assert!(
        String::from_utf8_lossy(&std::fs::read(beads_dir.join("issues.jsonl")).unwrap())
            .contains("tracked elsewhere")
    );
}

// ---------------------------------------------------------------------------
// Scenario: redirect
// ---------------------------------------------------------------------------

#[test]
fn redirected_workspace_resolves_to_target() {
    let target = plain_repo("target");
    let out = target.bd(&["init", "--prefix", "px"]);
    assert!(out.status.success());

    let front = plain_repo("front");
    let front_beads = front.root().join(".beads");
    std::fs::create_dir_all(&front_beads).unwrap();
    std::fs::write(
        front_beads.join("redirect"),
        target.root().join(".beads").to_str().unwrap(),
    )
    .unwrap();

    let id = front.bd_ok(&["create", "rides the redirect"]);

    // The record lives in the target workspace, not the front one.
    let target_journal =
        std::fs::read_to_string(target.root().join(".beads/issues.jsonl")).unwrap();
    assert!(target_journal.contains("rides the redirect"));
    assert!(target_journal.contains(&id));
    assert!(!front_beads.join("issues.jsonl").exists());
}

// ---------------------------------------------------------------------------
// Idempotence: a sync with no changes anywhere leaves bytes untouched
// ---------------------------------------------------------------------------

#[test]
fn sync_with_no_changes_is_byte_idempotent() {
    let (_remote, a, b) = seeded_pair();
    a.bd_ok(&["create", "steady state"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    let before = a.journal_bytes();
    a.bd_ok(&["sync"]);
    assert_eq!(a.journal_bytes(), before);
}

// ---------------------------------------------------------------------------
// Comments merge by union
// ---------------------------------------------------------------------------

#[test]
fn concurrent_comments_both_survive_sync() {
    let (_remote, a, b) = seeded_pair();
    let id = a.bd_ok(&["create", "discussion"]);
    a.bd_ok(&["sync"]);
    b.bd_ok(&["sync"]);

    a.bd_ok(&["comment", &id, "note from alice"]);
    a.bd_ok(&["sync"]);
    sleep_clock_tick();
    b.bd_ok(&["comment", &id, "note from bob"]);
    b.bd_ok(&["sync"]);
    a.bd_ok(&["sync"]);

    for clone in [&a, &b] {
        let shown = clone.bd_ok(&["show", &id]);
        assert!(shown.contains("note from alice"), "{shown}");
        assert!(shown.contains("note from bob"), "{shown}");
    }
}
