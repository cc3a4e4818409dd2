//! The sync coordinator: pull-first reconciliation of the journal with the
//! remote.
//!
//! One sync runs the linear protocol under the workspace lock: quiesce
//! local writes, snapshot the pre-pull journal as the merge base, pull,
//! three-way merge, write the merged journal, import it, commit, push.
//! A push rejected because the remote advanced releases the lock and
//! restarts the whole protocol, at most three times.
//!
//! Everything here drives the pure merge in [`merge`]; git interaction
//! goes through [`crate::git::Git`] so co-located and external workspaces
//! share every code path.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{Config, YamlConfig};
use crate::error::{BeadsError, Result};
use crate::flush;
use crate::git::Git;
use crate::import::{self, ImportOutcome};
use crate::journal::{self, codec, watermark};
use crate::store::Store;
use crate::workspace::Workspace;
use crate::workspace::lock::SyncLock;

pub mod merge;

use merge::RecordSet;

/// Push retry budget when the remote keeps advancing.
const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// The sync protocol's states, in protocol order. Transitions are linear
/// except `Pushing → Retrying → Locking` when the remote advances; any
/// state may fail. A terminal failure always releases the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Locking,
    Quiescing,
    Snapshotting,
    Pulling,
    Merging,
    Importing,
    Committing,
    Pushing,
    Done,
    Failed,
    Retrying,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locking => "locking",
            Self::Quiescing => "quiescing",
            Self::Snapshotting => "snapshotting",
            Self::Pulling => "pulling",
            Self::Merging => "merging",
            Self::Importing => "importing",
            Self::Committing => "committing",
            Self::Pushing => "pushing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What a sync did, for callers and logs.
#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    /// Whether a pull ran (false when no remote is configured).
    pub pulled: bool,
    /// Whether a commit was created (false when nothing changed).
    pub committed: bool,
    /// Whether a push ran and succeeded.
    pub pushed: bool,
    /// Records in the merged journal.
    pub merged_records: usize,
    /// What the post-merge import applied.
    pub import: ImportOutcome,
    /// Merge diagnostics (cycle repairs).
    pub diagnostics: Vec<String>,
    /// Attempts used (> 1 means the remote advanced mid-sync).
    pub attempts: u32,
    /// States traversed, for diagnostics.
    pub states: Vec<SyncState>,
}

enum Attempt {
    Completed(SyncReport),
    RemoteAdvanced(SyncReport),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one user-initiated sync.
///
/// # Errors
/// `SyncInProgress` when another sync holds the lock, `SyncConflict` when
/// git needs manual resolution, `Transient` when the push retry budget is
/// exhausted, `Cancelled` on cancellation. Local state stays consistent on
/// every path.
pub fn sync(
    store: &mut Store,
    ws: &Workspace,
    yaml: &YamlConfig,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    for attempt in 1..=MAX_ATTEMPTS {
        match sync_once(store, ws, yaml, cancel, attempt)? {
            Attempt::Completed(mut report) => {
                report.attempts = attempt;
                return Ok(report);
            }
            Attempt::RemoteAdvanced(report) => {
                warn!(attempt, "remote advanced during push; retrying sync");
                drop(report);
                std::thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
            }
        }
    }
    Err(BeadsError::Transient {
        detail: format!("remote kept advancing; gave up after {MAX_ATTEMPTS} sync attempts"),
    })
}

#[allow(clippy::too_many_lines)]
fn sync_once(
    store: &mut Store,
    ws: &Workspace,
    yaml: &YamlConfig,
    cancel: &CancelToken,
    attempt: u32,
) -> Result<Attempt> {
    let mut report = SyncReport::default();
    let mut enter = |report: &mut SyncReport, state: SyncState| {
        debug!(%state, attempt, "sync state");
        report.states.push(state);
    };

    enter(&mut report, SyncState::Locking);
    let _lock = SyncLock::acquire(&ws.dir)?;

    // Preflight: a workspace outside git cannot sync, and a repository
    // mid-merge or mid-rebase needs the operator, unless the conflict is
    // confined to the journal, which we can resolve ourselves.
    let Some(root) = ws.repo_root() else {
        return Err(BeadsError::Fatal {
            detail: format!(
                "workspace {} is not inside a git repository; sync needs one",
                ws.dir.display()
            ),
        });
    };
    let git = Git::new(root);
    let journal_rel = relative_journal_path(ws, root);
    if git.in_merge_or_rebase()? {
        let conflicted = git.conflicted_paths()?;
        if journal_only(&conflicted, &journal_rel) {
            resolve_journal_conflict(&git, ws, &journal_rel)?;
        } else {
            return Err(BeadsError::SyncConflict {
                detail: "the repository has an unresolved merge or rebase in progress".to_owned(),
            });
        }
    }

    let sync_branch = Config::new(yaml.clone(), Some(store)).sync_branch()?;
    let has_remote = !git.run(&["remote"])?.is_empty();

    // Quiesce: the on-disk journal reflects local intent before the pull.
    enter(&mut report, SyncState::Quiescing);
    flush::flush_locked(store, &ws.dir, cancel)?;

    // Base snapshot: the pre-pull journal. After the quiesce the store and
    // journal agree, so the local record set equals the base.
    enter(&mut report, SyncState::Snapshotting);
    let journal_path = journal::write_path(&ws.dir);
    let base_bytes = std::fs::read(&journal_path)?;
    let base_set = decoded(&base_bytes);
    let local_set = base_set.clone();

    // Git refuses to merge over a modified tracked file, so local journal
    // changes are committed before the pull. A conflicting remote commit
    // then surfaces as index stages the journal resolver understands.
    let beads_rel = relative_beads_path(ws, root);
    let local_journal_modified = git
        .status_porcelain()?
        .iter()
        .any(|line| line.contains(&beads_rel));
    if local_journal_modified {
        git.add(&[&beads_rel])?;
        let base_hash = codec::hash_hex(&base_bytes);
        git.commit(&format!("chore(beads): sync {}", &base_hash[..12]))?;
    }

    enter(&mut report, SyncState::Pulling);
    if has_remote {
        report.pulled = pull(&git, ws, &journal_rel, sync_branch.as_deref(), cancel)?;
    }

    enter(&mut report, SyncState::Merging);
    let remote_bytes = std::fs::read(&journal_path)?;
    let remote_set = decoded(&remote_bytes);
    let outcome = merge::merge(&base_set, &local_set, &remote_set);
    report.merged_records = outcome.merged.len();
    report.diagnostics = outcome.diagnostics;

    let merged_bytes = codec::encode(outcome.merged.values())?;
    codec::atomic_write(&journal_path, &merged_bytes)?;

    enter(&mut report, SyncState::Importing);
    report.import = import::apply(store, &merged_bytes, cancel)?;
    watermark::record(store, &journal_path, &merged_bytes)?;
    let hash = codec::hash_hex(&merged_bytes);

    enter(&mut report, SyncState::Committing);
    git.add(&[&beads_rel])?;
    report.committed = git.commit(&format!("chore(beads): sync {}", &hash[..12]))?;

    enter(&mut report, SyncState::Pushing);
    if has_remote {
        match push(&git, sync_branch.as_deref(), cancel) {
            Ok(()) => report.pushed = true,
            Err(PushError::RemoteAdvanced) => {
                report.states.push(SyncState::Retrying);
                return Ok(Attempt::RemoteAdvanced(report));
            }
            Err(PushError::Other(e)) => return Err(e),
        }
    }

    enter(&mut report, SyncState::Done);
    info!(
        pulled = report.pulled,
        committed = report.committed,
        pushed = report.pushed,
        records = report.merged_records,
        "sync complete"
    );
    Ok(Attempt::Completed(report))
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

/// Pull the sync branch. Returns whether a pull actually ran.
///
/// The four outcomes: fast-forward/no-op and clean auto-merge proceed;
/// a conflict confined to the journal is resolved in-process; anything
/// else aborts with `SyncConflict` after restoring the working tree.
fn pull(
    git: &Git,
    ws: &Workspace,
    journal_rel: &str,
    sync_branch: Option<&str>,
    cancel: &CancelToken,
) -> Result<bool> {
    let mut args = vec!["pull", "--rebase=false", "--no-edit"];
    if let Some(branch) = sync_branch {
        args.push("origin");
        args.push(branch);
    }
    match git.run_cancellable(&args, cancel) {
        Ok(_) => Ok(true),
        Err(BeadsError::Git { stderr, .. }) => {
            if stderr.contains("couldn't find remote ref")
                || stderr.contains("no tracking information")
            {
                // Nothing to pull yet; first push will create the branch.
                return Ok(false);
            }
            if git.in_merge_or_rebase()? {
                let conflicted = git.conflicted_paths()?;
                if journal_only(&conflicted, journal_rel) {
                    resolve_journal_conflict(git, ws, journal_rel)?;
                    return Ok(true);
                }
                // Conflicts beyond the journal: put the tree back and hand
                // over to the operator.
                let _ = git.output(&["merge", "--abort"]);
                return Err(BeadsError::SyncConflict {
                    detail: format!(
                        "git pull conflicted outside the journal ({})",
                        conflicted.join(", ")
                    ),
                });
            }
            Err(BeadsError::SyncConflict {
                detail: format!("git pull failed: {stderr}"),
            })
        }
        Err(other) => Err(other),
    }
}

fn journal_only(conflicted: &[String], journal_rel: &str) -> bool {
    !conflicted.is_empty() && conflicted.iter().all(|p| p == journal_rel)
}

/// Resolve a journal-confined git conflict by merging the three index
/// stages (base, ours, theirs) with the record merge and committing the
/// result.
fn resolve_journal_conflict(git: &Git, ws: &Workspace, journal_rel: &str) -> Result<()> {
    let stage = |n: u8| -> Result<Vec<u8>> {
        Ok(git
            .show(&format!(":{n}:{journal_rel}"))?
            .unwrap_or_default())
    };
    let base = decoded(&stage(1)?);
    let ours = decoded(&stage(2)?);
    let theirs = decoded(&stage(3)?);

    let outcome = merge::merge(&base, &ours, &theirs);
    for note in &outcome.diagnostics {
        warn!(%note, "journal conflict resolution");
    }
    let merged_bytes = codec::encode(outcome.merged.values())?;
    codec::atomic_write(&journal::write_path(&ws.dir), &merged_bytes)?;

    git.add(&[journal_rel])?;
    let commit = git.output(&["commit", "--no-edit"])?;
    if !commit.status.success() {
        return Err(BeadsError::Git {
            command: "git commit --no-edit".to_owned(),
            stderr: String::from_utf8_lossy(&commit.stderr).trim().to_owned(),
        });
    }
    info!("auto-resolved journal-only git conflict");
    Ok(())
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

enum PushError {
    /// The remote moved under us; the caller restarts the sync.
    RemoteAdvanced,
    Other(BeadsError),
}

fn push(git: &Git, sync_branch: Option<&str>, cancel: &CancelToken) -> Result<(), PushError> {
    let args: Vec<String> = match sync_branch {
        // A dedicated sync branch (protected-main setups) is pushed
        // explicitly; plain main/master go through the current branch.
        Some(branch) if branch != "main" && branch != "master" => vec![
            "push".to_owned(),
            "origin".to_owned(),
            format!("HEAD:{branch}"),
        ],
        _ => vec!["push".to_owned(), "origin".to_owned(), "HEAD".to_owned()],
    };
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    match git.run_cancellable(&arg_refs, cancel) {
        Ok(_) => Ok(()),
        Err(BeadsError::Git { stderr, command }) => {
            if stderr.contains("fetch first")
                || stderr.contains("non-fast-forward")
                || stderr.contains("[rejected]")
            {
                Err(PushError::RemoteAdvanced)
            } else {
                Err(PushError::Other(BeadsError::Git { command, stderr }))
            }
        }
        Err(other) => Err(PushError::Other(other)),
    }
}

// ---------------------------------------------------------------------------
// Merge driver
// ---------------------------------------------------------------------------

/// Merge three journal files the way git's merge driver protocol expects:
/// read base/local/remote, merge, return the bytes for the result file.
/// Registered under the driver name `beads` by `bd init`.
///
/// # Errors
/// I/O errors reading the stage files.
pub fn merge_files(base: &Path, local: &Path, remote: &Path) -> Result<Vec<u8>> {
    let read = |p: &Path| -> Result<Vec<u8>> {
        if p.exists() {
            Ok(std::fs::read(p)?)
        } else {
            Ok(Vec::new())
        }
    };
    let outcome = merge::merge(
        &decoded(&read(base)?),
        &decoded(&read(local)?),
        &decoded(&read(remote)?),
    );
    codec::encode(outcome.merged.values())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decoded(bytes: &[u8]) -> RecordSet {
    let (records, skipped) = codec::decode(bytes);
    for s in &skipped {
        warn!(line = s.line, detail = %s.detail, "skipping malformed journal line");
    }
    codec::collapse(records)
}

fn relative_beads_path(ws: &Workspace, root: &Path) -> String {
    ws.dir
        .strip_prefix(root)
        .map_or_else(|_| ws.dir.display().to_string(), |p| p.display().to_string())
}

fn relative_journal_path(ws: &Workspace, root: &Path) -> String {
    let journal = journal::write_path(&ws.dir);
    journal
        .strip_prefix(root)
        .map_or_else(|_| journal.display().to_string(), |p| p.display().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_render_lowercase() {
        assert_eq!(SyncState::Pulling.to_string(), "pulling");
        assert_eq!(SyncState::Retrying.to_string(), "retrying");
    }

    #[test]
    fn journal_only_requires_every_conflict_to_be_the_journal() {
        let rel = ".beads/issues.jsonl";
        assert!(journal_only(&[rel.to_owned()], rel));
        assert!(!journal_only(&[], rel));
        assert!(!journal_only(
            &[rel.to_owned(), "src/main.rs".to_owned()],
            rel
        ));
    }

    #[test]
    fn merge_files_handles_missing_base() {
        use tempfile::TempDir;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local.jsonl");
        let remote = dir.path().join("remote.jsonl");
        std::fs::write(
            &local,
            "{\"id\":\"bd-aa1bb2\",\"title\":\"l\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\",\"priority\":2}\n",
        )
        .unwrap();
        std::fs::write(
            &remote,
            "{\"id\":\"bd-cc3dd4\",\"title\":\"r\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\",\"priority\":2}\n",
        )
        .unwrap();

        let merged = merge_files(&dir.path().join("absent"), &local, &remote).unwrap();
        let text = String::from_utf8(merged).unwrap();
        assert!(text.contains("bd-aa1bb2"));
        assert!(text.contains("bd-cc3dd4"));
    }

    #[test]
    fn merge_driver_output_is_stable() {
        use tempfile::TempDir;
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("same.jsonl");
        std::fs::write(
            &f,
            "{\"id\":\"bd-aa1bb2\",\"title\":\"x\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\",\"priority\":2}\n",
        )
        .unwrap();
        let one = merge_files(&f, &f, &f).unwrap();
        let two = merge_files(&f, &f, &f).unwrap();
        assert_eq!(one, two);
    }
}
