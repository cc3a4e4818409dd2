//! The per-command workspace session.
//!
//! A [`WorkspaceSession`] carries everything one command execution needs:
//! the resolved workspace, the YAML config, the open store, and the
//! cancellation token. It is passed explicitly through operations: no
//! module-level current-store or current-context globals; the only
//! process-global object is the resolver cache.
//!
//! Opening a session runs the startup discipline: crash-recovery sweep,
//! auto-import when the journal changed behind the store's back (a git
//! pull delivering remote edits), and auto-flush when dirty records are
//! pending from a previous run.

use std::path::Path;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::{Config, YamlConfig};
use crate::error::Result;
use crate::store::Store;
use crate::store::meta::{META_BD_VERSION, META_CLONE_ID, META_REPO_ID};
use crate::workspace::{self, Workspace};
use crate::{flush, import, journal, recovery};

/// One command's view of a workspace.
pub struct WorkspaceSession {
    pub workspace: Workspace,
    pub yaml: YamlConfig,
    pub store: Store,
    pub cancel: CancelToken,
}

/// Options for opening a session.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Skip the journal freshness check (no auto-import).
    pub no_auto_import: bool,
    /// Skip the pending-dirty auto-flush.
    pub no_auto_flush: bool,
}

impl WorkspaceSession {
    /// Resolve the workspace for `cwd` and open its store with the startup
    /// discipline applied.
    ///
    /// # Errors
    /// `NotFound` when no workspace exists; store and journal errors
    /// otherwise.
    pub fn open(cwd: &Path, options: OpenOptions) -> Result<Self> {
        let ws = workspace::resolve_cached(cwd)?;
        let yaml = YamlConfig::load(&ws.dir)?;
        // JSONL-only mode: an in-memory store, repopulated from the
        // journal each run. The dual-store discipline is unchanged; only
        // the database file is skipped.
        let mut store = if yaml.no_db {
            Store::open_in_memory()?
        } else {
            Store::open(&ws.db_path())?
        };
        let cancel = CancelToken::new();

        ensure_clone_identity(&store)?;
        store.set_metadata(META_BD_VERSION, env!("CARGO_PKG_VERSION"))?;
        if store.get_metadata(META_REPO_ID)?.is_none() {
            if let Some(root) = ws.repo_root() {
                store.set_metadata(META_REPO_ID, &short_hash(&root.display().to_string()))?;
            }
        }

        let sweep = recovery::startup_sweep(&ws.dir, &store)?;
        debug!(?sweep, "startup sweep");

        if !options.no_auto_import {
            let journal_path = journal::read_path(&ws.dir);
            if journal::watermark::has_changed(&store, &journal_path)? {
                debug!("journal changed since last watermark; importing");
                import::import(&mut store, &ws, &cancel)?;
            }
        }
        if !options.no_auto_flush && sweep.flush_pending {
            flush::flush(&mut store, &ws, &cancel)?;
        }

        Ok(Self {
            workspace: ws,
            yaml,
            store,
            cancel,
        })
    }

    /// The layered configuration view for this session.
    #[must_use]
    pub fn config(&self) -> Config<'_> {
        Config::new(self.yaml.clone(), Some(&self.store))
    }

    /// The actor name for the audit trail: explicit flag, then git
    /// user.name, then the OS user.
    #[must_use]
    pub fn actor(&self, explicit: Option<&str>) -> String {
        if let Some(name) = explicit {
            return name.to_owned();
        }
        if let Some(root) = self.workspace.repo_root() {
            if let Ok(name) = crate::git::Git::new(root).run(&["config", "user.name"]) {
                if !name.is_empty() {
                    return name;
                }
            }
        }
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned())
    }
}

/// Give every clone a stable identity for diagnostics, derived from the
/// database path and first-open time.
fn ensure_clone_identity(store: &Store) -> Result<()> {
    if store.get_metadata(META_CLONE_ID)?.is_some() {
        return Ok(());
    }
    let seed = format!(
        "{}|{}|{}",
        store.path().display(),
        std::process::id(),
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
    );
    store.set_metadata(META_CLONE_ID, &short_hash(&seed))?;
    Ok(())
}

fn short_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn clone_identity_is_stable_across_reopens() {
        let store = Store::open_in_memory().unwrap();
        ensure_clone_identity(&store).unwrap();
        let first = store.get_metadata(META_CLONE_ID).unwrap().unwrap();
        ensure_clone_identity(&store).unwrap();
        let second = store.get_metadata(META_CLONE_ID).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn open_applies_startup_discipline() {
        let dir = TempDir::new().unwrap();
        let ws_dir = dir.path().join(".beads");
        std::fs::create_dir_all(&ws_dir).unwrap();
        // A journal written by "another clone" with no store yet.
        std::fs::write(
            ws_dir.join(journal::JOURNAL_FILE),
            "{\"id\":\"bd-aa1bb2\",\"title\":\"from remote\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\",\"priority\":2}\n",
        )
        .unwrap();

        workspace::invalidate_cache();
        let session = WorkspaceSession::open(dir.path(), OpenOptions::default()).unwrap();
        let got = session
            .store
            .try_get(&crate::model::IssueId::new("bd-aa1bb2").unwrap())
            .unwrap();
        assert!(got.is_some(), "auto-import must pick up the journal");
    }
}
