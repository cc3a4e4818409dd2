//! Tombstone compaction.
//!
//! Tombstones stay in the journal indefinitely so deletions propagate to
//! every clone. Purging one is safe only when no live record anywhere
//! still references the id, which cannot be proven locally. Compaction is
//! therefore operator-initiated: it removes tombstones no local live
//! record references, and the operator asserts the fleet has converged.

use tracing::info;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::flush;
use crate::model::IssueId;
use crate::store::Store;
use crate::workspace::Workspace;
use crate::workspace::lock::SyncLock;

/// What a compaction removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Tombstones purged from store and journal.
    pub purged: Vec<IssueId>,
    /// Tombstones kept because a live record still references them.
    pub retained: Vec<IssueId>,
}

/// Purge unreferenced tombstones and rewrite the journal.
///
/// # Errors
/// `SyncInProgress` when the workspace lock is held.
pub fn compact(store: &mut Store, ws: &Workspace, cancel: &CancelToken) -> Result<CompactOutcome> {
    let _lock = SyncLock::acquire(&ws.dir)?;
    cancel.check()?;

    let all = store.all_issues()?;
    let mut outcome = CompactOutcome::default();

    for issue in &all {
        if !issue.is_tombstone() {
            continue;
        }
        let referenced = all.iter().any(|other| {
            !other.is_tombstone()
                && other
                    .dependencies
                    .iter()
                    .any(|e| e.target.local() == Some(&issue.id))
        });
        if referenced {
            outcome.retained.push(issue.id.clone());
        } else {
            outcome.purged.push(issue.id.clone());
        }
    }

    if outcome.purged.is_empty() {
        return Ok(outcome);
    }

    let purged = outcome.purged.clone();
    store.transaction(|tx| {
        for id in &purged {
            tx.execute("DELETE FROM issues WHERE id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?1", [id.as_str()])?;
        }
        Ok(())
    })?;

    flush::flush_locked(store, &ws.dir, cancel)?;
    info!(purged = outcome.purged.len(), retained = outcome.retained.len(), "compacted tombstones");
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
