//! The flush engine: serialize the store to the journal under the
//! workspace lock.
//!
//! A flush writes the union of all live non-ephemeral records plus all
//! tombstones, atomically replaces the journal, records the new watermark,
//! and clears the dirty set. The watermark and the dirty-set clear commit
//! in one transaction, so an aborted flush never leaves the two
//! disagreeing.

use std::path::Path;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::journal::{self, codec};
use crate::store::{Store, meta};
use crate::workspace::Workspace;
use crate::workspace::lock::SyncLock;

/// What a flush did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records written (tombstones included, ephemerals excluded).
    pub records: usize,
    /// Journal size in bytes.
    pub bytes: usize,
    /// Whether a legacy `beads.jsonl` was migrated away.
    pub migrated_legacy: bool,
}

/// Flush under a freshly-acquired workspace lock.
///
/// # Errors
/// `SyncInProgress` when the lock is held; write errors are fatal and
/// leave the previous journal intact.
pub fn flush(store: &mut Store, ws: &Workspace, cancel: &CancelToken) -> Result<FlushOutcome> {
    let _lock = SyncLock::acquire(&ws.dir)?;
    flush_locked(store, &ws.dir, cancel)
}

/// Flush when the caller already holds the workspace lock (the sync
/// coordinator's quiesce step).
///
/// # Errors
/// Same as [`flush`], minus lock acquisition.
pub fn flush_locked(
    store: &mut Store,
    workspace_dir: &Path,
    cancel: &CancelToken,
) -> Result<FlushOutcome> {
    cancel.check()?;

    let issues = store.all_issues()?;
    let bytes = codec::encode(issues.iter())?;
    let records = issues.iter().filter(|i| !i.ephemeral).count();

    cancel.check()?;
    let path = journal::write_path(workspace_dir);
    codec::atomic_write(&path, &bytes)?;

    // The canonical file now exists; retire the legacy one.
    let legacy = workspace_dir.join(journal::LEGACY_JOURNAL_FILE);
    let migrated_legacy = legacy.exists();
    if migrated_legacy {
        std::fs::remove_file(&legacy)?;
        debug!(path = %legacy.display(), "removed legacy journal");
    }

    let hash = codec::hash_hex(&bytes);
    let mtime = file_mtime_ns(&path);
    store.transaction(|tx| {
        meta::set_metadata(tx, meta::META_JOURNAL_HASH, &hash)?;
        if let Some(mtime) = mtime {
            meta::set_metadata(tx, meta::META_JOURNAL_MTIME_NS, &mtime.to_string())?;
        }
        meta::clear_dirty(tx)?;
        Ok(())
    })?;

    info!(records, bytes = bytes.len(), "flushed journal");
    Ok(FlushOutcome {
        records,
        bytes: bytes.len(),
        migrated_legacy,
    })
}

/// Flush only when the dirty set is non-empty.
///
/// # Errors
/// Same as [`flush`].
pub fn flush_if_dirty(
    store: &mut Store,
    ws: &Workspace,
    cancel: &CancelToken,
) -> Result<Option<FlushOutcome>> {
    if !store.has_dirty()? {
        return Ok(None);
    }
    flush(store, ws, cancel).map(Some)
}

fn file_mtime_ns(path: &Path) -> Option<i128> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let nanos = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_nanos();
    i128::try_from(nanos).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::watermark;
    use crate::store::NewIssue;
    use crate::workspace::RepoLocation;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Workspace, Store) {
        let dir = TempDir::new().unwrap();
        let ws_dir = dir.path().join(".beads");
        std::fs::create_dir_all(&ws_dir).unwrap();
        let ws = Workspace {
            dir: ws_dir,
            redirected: false,
            location: RepoLocation::Unversioned,
        };
        let store = Store::open_in_memory().unwrap();
        (dir, ws, store)
    }

    #[test]
    fn flush_writes_journal_and_clears_dirty() {
        let (_tmp, ws, mut store) = setup();
        store
            .create(
                NewIssue {
                    title: "first".to_owned(),
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();
        assert!(store.has_dirty().unwrap());

        let outcome = flush(&mut store, &ws, &CancelToken::new()).unwrap();
        assert_eq!(outcome.records, 1);
        assert!(!store.has_dirty().unwrap());

        let path = journal::write_path(&ws.dir);
        assert!(path.exists());
        assert!(!watermark::has_changed(&store, &path).unwrap());
    }

    #[test]
    fn flush_omits_ephemeral_records() {
        let (_tmp, ws, mut store) = setup();
        store
            .create(
                NewIssue {
                    title: "wisp".to_owned(),
                    ephemeral: true,
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();
        store
            .create(
                NewIssue {
                    title: "real".to_owned(),
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();

        let outcome = flush(&mut store, &ws, &CancelToken::new()).unwrap();
        assert_eq!(outcome.records, 1);
        let text = std::fs::read_to_string(journal::write_path(&ws.dir)).unwrap();
        assert!(text.contains("real"));
        assert!(!text.contains("wisp"));
    }

    #[test]
    fn flush_includes_tombstones() {
        let (_tmp, ws, mut store) = setup();
        let issue = store
            .create(
                NewIssue {
                    title: "doomed".to_owned(),
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();
        store.delete(&issue.id, "tester", false, None).unwrap();

        flush(&mut store, &ws, &CancelToken::new()).unwrap();
        let text = std::fs::read_to_string(journal::write_path(&ws.dir)).unwrap();
        assert!(text.contains("deleted_at"));
    }

    #[test]
    fn flush_migrates_legacy_journal() {
        let (_tmp, ws, mut store) = setup();
        std::fs::write(ws.dir.join(journal::LEGACY_JOURNAL_FILE), "").unwrap();

        let outcome = flush(&mut store, &ws, &CancelToken::new()).unwrap();
        assert!(outcome.migrated_legacy);
        assert!(!ws.dir.join(journal::LEGACY_JOURNAL_FILE).exists());
        assert!(ws.dir.join(journal::JOURNAL_FILE).exists());
    }

    #[test]
    fn flush_if_dirty_skips_clean_store() {
        let (_tmp, ws, mut store) = setup();
        let outcome = flush_if_dirty(&mut store, &ws, &CancelToken::new()).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn cancelled_flush_leaves_journal_untouched() {
        let (_tmp, ws, mut store) = setup();
        std::fs::write(journal::write_path(&ws.dir), b"original\n").unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = flush(&mut store, &ws, &token).unwrap_err();
        assert!(matches!(err, crate::error::BeadsError::Cancelled));
        assert_eq!(
            std::fs::read(journal::write_path(&ws.dir)).unwrap(),
            b"original\n"
        );
    }

    #[test]
    fn flush_is_deterministic_across_runs() {
        let (_tmp, ws, mut store) = setup();
        store
            .create(
                NewIssue {
                    title: "stable".to_owned(),
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();
        flush(&mut store, &ws, &CancelToken::new()).unwrap();
        let first = std::fs::read(journal::write_path(&ws.dir)).unwrap();
        flush(&mut store, &ws, &CancelToken::new()).unwrap();
        let second = std::fs::read(journal::write_path(&ws.dir)).unwrap();
        assert_eq!(first, second);
    }
}
