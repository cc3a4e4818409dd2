//! The journal: a line-delimited JSON file of issue records, version
//! controlled with git.

use std::path::{Path, PathBuf};

pub mod codec;
pub mod watermark;

pub use codec::{LineDecoder, SkippedLine, atomic_write, collapse, decode, encode, hash_hex};

/// The canonical journal filename.
pub const JOURNAL_FILE: &str = "issues.jsonl";

/// The legacy filename, accepted on read and migrated on next flush.
pub const LEGACY_JOURNAL_FILE: &str = "beads.jsonl";

/// Path the journal should be written to.
#[must_use]
pub fn write_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(JOURNAL_FILE)
}

/// Path the journal should be read from: the canonical file when present,
/// otherwise the legacy file when that exists, otherwise the canonical
/// (missing) path.
#[must_use]
pub fn read_path(workspace_dir: &Path) -> PathBuf {
    let canonical = workspace_dir.join(JOURNAL_FILE);
    if canonical.exists() {
        return canonical;
    }
    let legacy = workspace_dir.join(LEGACY_JOURNAL_FILE);
    if legacy.exists() {
        return legacy;
    }
    canonical
}

/// The legacy path, when a legacy journal is present and the canonical one
/// is not. The flush engine removes it after migrating.
#[must_use]
pub fn legacy_path_pending_migration(workspace_dir: &Path) -> Option<PathBuf> {
    let legacy = workspace_dir.join(LEGACY_JOURNAL_FILE);
    if legacy.exists() && !workspace_dir.join(JOURNAL_FILE).exists() {
        Some(legacy)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_path_prefers_canonical() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(JOURNAL_FILE), "").unwrap();
        std::fs::write(dir.path().join(LEGACY_JOURNAL_FILE), "").unwrap();
        assert_eq!(read_path(dir.path()), dir.path().join(JOURNAL_FILE));
    }

    #[test]
    fn read_path_falls_back_to_legacy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LEGACY_JOURNAL_FILE), "").unwrap();
        assert_eq!(read_path(dir.path()), dir.path().join(LEGACY_JOURNAL_FILE));
        assert!(legacy_path_pending_migration(dir.path()).is_some());
    }

    #[test]
    fn missing_both_yields_canonical() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_path(dir.path()), dir.path().join(JOURNAL_FILE));
        assert!(legacy_path_pending_migration(dir.path()).is_none());
    }
}
