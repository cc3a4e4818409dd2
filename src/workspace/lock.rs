//! The workspace sync lock.
//!
//! An advisory OS-level file lock at `.beads/.sync.lock`. Mere lock
//! ownership is the signal; the file's PID content exists only for the
//! stale-lock diagnosis. Acquisition is non-blocking: a held lock fails
//! immediately with `SyncInProgress` instead of queuing.
//!
//! flock-style locks die with their owner, so a crashed process never
//! wedges the workspace. The PID stamp additionally lets startup recovery
//! report locks whose owner is long gone.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{BeadsError, Result};

/// The lock file name inside a workspace.
pub const LOCK_FILE: &str = ".sync.lock";

/// An exclusive hold on the workspace. Released on drop; never leave the
/// release to manual control flow.
#[derive(Debug)]
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl SyncLock {
    /// Try to take the workspace lock without blocking.
    ///
    /// # Errors
    /// `SyncInProgress` when another process holds it; I/O errors
    /// otherwise.
    pub fn acquire(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(BeadsError::SyncInProgress { lock_path: path });
            }
            Err(e) => return Err(BeadsError::Io(e)),
        }

        // Stamp the owner for diagnostics; failures here are harmless.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { file, path })
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// The PID recorded in a lock file, if readable.
#[must_use]
pub fn lock_owner(workspace_dir: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(workspace_dir.join(LOCK_FILE)).ok()?;
    raw.trim().parse().ok()
}

/// Whether a process with `pid` is alive. On non-procfs platforms the
/// answer is conservatively `true`.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
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
    fn acquire_writes_pid_stamp() {
        let dir = TempDir::new().unwrap();
        let lock = SyncLock::acquire(dir.path()).unwrap();
        assert_eq!(lock_owner(dir.path()), Some(std::process::id()));
        drop(lock);
    }

    #[test]
    fn second_acquire_in_same_process_fails_fast() {
        let dir = TempDir::new().unwrap();
        let _held = SyncLock::acquire(dir.path()).unwrap();
        // flock is per-file-description: a second open + try_lock conflicts.
        let err = SyncLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, BeadsError::SyncInProgress { .. }));
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let dir = TempDir::new().unwrap();
        drop(SyncLock::acquire(dir.path()).unwrap());
        let second = SyncLock::acquire(dir.path());
        assert!(second.is_ok());
    }

    #[test]
    fn own_pid_reads_as_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
