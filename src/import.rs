//! The import engine: apply the journal to the store.
//!
//! Create/update/delete semantics per record, last-writer-wins by
//! `updated_at`, tombstone discipline (a newer tombstone deletes and
//! refuses to recreate), and two-pass dependency resolution: edges whose
//! target does not exist yet are deferred, retried after the full pass,
//! and downgraded to external references when still unresolved.
//!
//! Import is transactional per-record, not per-file: a malformed line
//! skips that record only, and a cancellation leaves already-applied
//! records in place.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::params;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::journal::{self, SkippedLine, codec, watermark};
use crate::model::{DepEdge, DepTarget, Issue, IssueId};
use crate::store::Store;
use crate::workspace::Workspace;
use crate::workspace::lock::SyncLock;

/// What an import did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Lines the decoder had to skip (logged, not fatal).
    pub parse_errors: Vec<SkippedLine>,
    /// Edges downgraded to external references.
    pub downgraded_edges: usize,
}

/// Import under a freshly-acquired workspace lock.
///
/// # Errors
/// `SyncInProgress` when the lock is held.
pub fn import(store: &mut Store, ws: &Workspace, cancel: &CancelToken) -> Result<ImportOutcome> {
    let _lock = SyncLock::acquire(&ws.dir)?;
    import_locked(store, &ws.dir, cancel)
}

/// Import when the caller already holds the workspace lock.
///
/// # Errors
/// `Cancelled` between records on cancellation; store errors otherwise.
pub fn import_locked(
    store: &mut Store,
    workspace_dir: &Path,
    cancel: &CancelToken,
) -> Result<ImportOutcome> {
    let path = journal::read_path(workspace_dir);
    if !path.exists() {
        return Ok(ImportOutcome::default());
    }
    let bytes = std::fs::read(&path)?;
    let outcome = apply(store, &bytes, cancel)?;

    // The store now reflects these bytes.
    watermark::record(store, &path, &bytes)?;

    info!(
        created = outcome.created,
        updated = outcome.updated,
        deleted = outcome.deleted,
        parse_errors = outcome.parse_errors.len(),
        "imported journal"
    );
    Ok(outcome)
}

/// Apply journal bytes to the store without touching watermarks. Shared by
/// the standalone import and the sync coordinator (which records the
/// watermark itself).
///
/// # Errors
/// `Cancelled` between records; store errors otherwise.
pub fn apply(store: &mut Store, bytes: &[u8], cancel: &CancelToken) -> Result<ImportOutcome> {
    let mut outcome = ImportOutcome::default();
    // Edges whose target does not exist yet; retried after the full pass
    // so an id later in the file still resolves.
    let mut deferred: Vec<(IssueId, DepEdge)> = Vec::new();
    let records: Vec<Issue> = {
        let (records, skipped) = codec::decode(bytes);
        outcome.parse_errors = skipped;
        records
    };

    for record in records {
        cancel.check()?;
        apply_record(store, record, &mut outcome, &mut deferred)?;
    }

    // Second pass: deferred edges whose targets arrived later.
    let mut still_unresolved = Vec::new();
    for (owner, edge) in deferred {
        cancel.check()?;
        let target_exists = edge
            .target
            .local()
            .map(|t| store.try_get(t))
            .transpose()?
            .flatten()
            .is_some();
        if target_exists {
            insert_edge(store, &owner, &edge)?;
        } else {
            still_unresolved.push((owner, edge));
        }
    }

    // Whatever is left references an id this workspace has never seen:
    // downgrade to an explicit external reference.
    for (owner, edge) in still_unresolved {
        let Some(target) = edge.target.local() else {
            continue;
        };
        let external = DepEdge {
            target: DepTarget::External {
                project: target.prefix().to_owned(),
                id: target.to_string(),
            },
            dep_type: edge.dep_type,
        };
        warn!(
            owner = %owner,
            target = %target,
            "dependency target not found; recording as external reference"
        );
        insert_edge(store, &owner, &external)?;
        outcome.downgraded_edges += 1;
    }

    Ok(outcome)
}

fn apply_record(
    store: &mut Store,
    mut record: Issue,
    outcome: &mut ImportOutcome,
    deferred: &mut Vec<(IssueId, DepEdge)>,
) -> Result<()> {
    let stored = store.try_get(&record.id)?;

    if record.is_tombstone() {
        let deleted_at = record.deleted_at.unwrap_or(record.updated_at);
        match &stored {
            Some(existing) if existing.is_tombstone() => {
                outcome.unchanged += 1;
            }
            // A tombstone at or after the stored record's clock deletes it;
            // an older tombstone loses to the live record.
            Some(existing) if deleted_at >= existing.updated_at => {
                store.transaction(|tx| crate::store::write_issue(tx, &record))?;
                outcome.deleted += 1;
            }
            Some(_) => {
                outcome.unchanged += 1;
            }
            None => {
                // Mark the tombstone locally so this id can never be
                // recreated by a later import.
                store.transaction(|tx| crate::store::write_issue(tx, &record))?;
                outcome.deleted += 1;
            }
        }
        return Ok(());
    }

    match stored {
        Some(existing) if existing.is_tombstone() => {
            let deleted_at = existing.deleted_at.unwrap_or(existing.updated_at);
            if record.updated_at > deleted_at {
                // The record post-dates the deletion; it may live again.
                split_unresolved_edges(store, &mut record, deferred)?;
                store.transaction(|tx| crate::store::write_issue(tx, &record))?;
                outcome.created += 1;
            } else {
                // Refuse to recreate under a newer tombstone.
                outcome.unchanged += 1;
            }
        }
        Some(existing) if record.updated_at > existing.updated_at => {
            split_unresolved_edges(store, &mut record, deferred)?;
            store.transaction(|tx| crate::store::write_issue(tx, &record))?;
            outcome.updated += 1;
        }
        Some(_) => {
            outcome.unchanged += 1;
        }
        None => {
            split_unresolved_edges(store, &mut record, deferred)?;
            store.transaction(|tx| crate::store::write_issue(tx, &record))?;
            outcome.created += 1;
        }
    }
    Ok(())
}

/// Pull out local edges whose target is not yet importable; they retry
/// after the full pass.
fn split_unresolved_edges(
    store: &Store,
    record: &mut Issue,
    deferred: &mut Vec<(IssueId, DepEdge)>,
) -> Result<()> {
    let mut kept = BTreeSet::new();
    for edge in std::mem::take(&mut record.dependencies) {
        let resolvable = match edge.target.local() {
            Some(target) => store.try_get(target)?.is_some(),
            None => true,
        };
        if resolvable {
            kept.insert(edge);
        } else {
            deferred.push((record.id.clone(), edge));
        }
    }
    record.dependencies = kept;
    Ok(())
}

/// Insert an edge row directly, without bumping the owner's LWW clock;
/// import must never make local state look newer than the journal.
fn insert_edge(store: &mut Store, owner: &IssueId, edge: &DepEdge) -> Result<()> {
    store.transaction(|tx| {
        tx.execute(
            "INSERT INTO dependencies (issue_id, target, dep_type, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(issue_id, target, dep_type) DO NOTHING",
            params![
                owner.as_str(),
                edge.target.to_string(),
                edge.dep_type.as_str(),
                crate::store::fmt_ts(chrono::Utc::now()),
            ],
        )?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
