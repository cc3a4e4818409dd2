//! Crash recovery: the startup sweep.
//!
//! Checks for the three kinds of debris a crash can leave behind:
//! orphaned journal tempfiles, a stale lock stamp whose owner died, and
//! pending dirty-set entries. Tempfiles and stale stamps are cleaned here;
//! pending dirty entries are reported so the session can flush.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::error::Result;
use crate::journal::{self, codec};
use crate::store::Store;
use crate::workspace::lock::{self, LOCK_FILE, SyncLock};

/// Age past which a dead owner's lock stamp is considered stale.
const STALE_LOCK_AGE: Duration = Duration::from_secs(300);

/// What the sweep found and did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphaned tempfiles that were removed.
    pub removed_tempfiles: usize,
    /// Whether a stale lock stamp was broken.
    pub broke_stale_lock: bool,
    /// Whether dirty-set entries are pending a flush.
    pub flush_pending: bool,
}

/// Run the startup sweep for one workspace.
///
/// # Errors
/// Store read errors; tempfile removal failures are fatal because a
/// lingering tempfile would shadow the next atomic write.
pub fn startup_sweep(workspace_dir: &Path, store: &Store) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for name in [journal::JOURNAL_FILE, journal::LEGACY_JOURNAL_FILE] {
        let tmp = codec::temp_path(&workspace_dir.join(name));
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
            warn!(path = %tmp.display(), "removed orphaned journal tempfile");
            report.removed_tempfiles += 1;
        }
    }

    report.broke_stale_lock = break_stale_lock(workspace_dir);
    report.flush_pending = store.has_dirty()?;
    if report.flush_pending {
        info!("dirty records pending from a previous run; flush scheduled");
    }
    Ok(report)
}

/// Remove the lock stamp when its recorded owner is dead and the file is
/// old. The flock itself died with the owner; this only clears the stamp
/// so diagnostics stop pointing at a ghost. A live flock is never touched:
/// acquisition is attempted first and backed out.
fn break_stale_lock(workspace_dir: &Path) -> bool {
    let path = workspace_dir.join(LOCK_FILE);
    let Ok(meta) = std::fs::metadata(&path) else {
        return false;
    };
    let old_enough = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE);
    if !old_enough {
        return false;
    }
    let Some(owner) = lock::lock_owner(workspace_dir) else {
        return false;
    };
    if lock::pid_alive(owner) {
        return false;
    }
    // Confirm no live flock remains before unlinking.
    match SyncLock::acquire(workspace_dir) {
        Ok(held) => {
            drop(held);
            let removed = std::fs::remove_file(&path).is_ok();
            if removed {
                warn!(owner, path = %path.display(), "broke stale lock");
            }
            removed
        }
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sweep_removes_orphaned_tempfiles() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let tmp = codec::temp_path(&dir.path().join(journal::JOURNAL_FILE));
        std::fs::write(&tmp, b"partial").unwrap();

        let report = startup_sweep(dir.path(), &store).unwrap();
        assert_eq!(report.removed_tempfiles, 1);
        assert!(!tmp.exists());
    }

    #[test]
    fn sweep_reports_pending_dirty() {
        use crate::store::NewIssue;
        let dir = TempDir::new().unwrap();
        let mut store = Store::open_in_memory().unwrap();
        store
            .create(
                NewIssue {
                    title: "pending".to_owned(),
                    ..NewIssue::default()
                },
                "tester",
            )
            .unwrap();

        let report = startup_sweep(dir.path(), &store).unwrap();
        assert!(report.flush_pending);
    }

    #[test]
    fn live_locks_are_never_broken() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let _held = SyncLock::acquire(dir.path()).unwrap();

        let report = startup_sweep(dir.path(), &store).unwrap();
        assert!(!report.broke_stale_lock);
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn fresh_lock_stamp_is_left_alone_even_with_dead_owner() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        // A stamp from a certainly-dead pid, but younger than the
        // threshold.
        std::fs::write(dir.path().join(LOCK_FILE), "4000000000\n").unwrap();

        let report = startup_sweep(dir.path(), &store).unwrap();
        assert!(!report.broke_stale_lock);
    }
}
