//! Typed dependency edges: add with cycle checking, remove, and traversal.

use chrono::Utc;
use rusqlite::params;

use crate::error::{BeadsError, Result};
use crate::model::{DepTarget, DepType, Issue, IssueId, graph};

use super::{Store, fmt_ts, meta, read_issue};

impl Store {
    /// Add a typed edge `from → to`. Structural edges (blocks,
    /// parent-child) are cycle-checked against the whole graph first.
    ///
    /// # Errors
    /// `NotFound` when either endpoint is absent, `InvariantViolated` with
    /// a cycle diagnosis when the edge would close a loop.
    pub fn add_dependency(
        &mut self,
        from: &IssueId,
        to: &IssueId,
        dep_type: DepType,
        actor: &str,
    ) -> Result<()> {
        if dep_type.is_structural() {
            let all = self.all_issues()?;
            let structural = graph::structural_graph(all.iter());
            if graph::would_cycle(&structural, from, to) {
                return Err(BeadsError::InvariantViolated {
                    detail: format!(
                        "adding {} edge {from} -> {to} would create a dependency cycle",
                        dep_type.as_str()
                    ),
                });
            }
        }
        let (from, to) = (from.clone(), to.clone());
        let actor = actor.to_owned();
        self.transaction(|tx| {
            let Some(owner) = read_issue(tx, &from)? else {
                return Err(BeadsError::NotFound {
                    id: from.to_string(),
                });
            };
            if read_issue(tx, &to)?.is_none() {
                return Err(BeadsError::NotFound { id: to.to_string() });
            }
            tx.execute(
                "INSERT INTO dependencies (issue_id, target, dep_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(issue_id, target, dep_type) DO NOTHING",
                params![
                    from.as_str(),
                    to.as_str(),
                    dep_type.as_str(),
                    fmt_ts(Utc::now()),
                ],
            )?;
            touch(tx, &from)?;
            meta::record_event(
                tx,
                &from,
                "dep_added",
                &actor,
                None,
                Some(&format!("{} {}", dep_type.as_str(), to)),
            )?;
            if !owner.ephemeral {
                meta::mark_dirty(tx, &from)?;
            }
            Ok(())
        })
    }

    /// Add an edge to an issue in another project
    /// (`external:<project>:<id>`). External targets are never
    /// existence-checked or cycle-checked.
    ///
    /// # Errors
    /// `NotFound` when `from` is absent.
    pub fn add_external_dependency(
        &mut self,
        from: &IssueId,
        target: &DepTarget,
        dep_type: DepType,
        actor: &str,
    ) -> Result<()> {
        let from = from.clone();
        let target = target.clone();
        let actor = actor.to_owned();
        self.transaction(|tx| {
            let Some(owner) = read_issue(tx, &from)? else {
                return Err(BeadsError::NotFound {
                    id: from.to_string(),
                });
            };
            tx.execute(
                "INSERT INTO dependencies (issue_id, target, dep_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(issue_id, target, dep_type) DO NOTHING",
                params![
                    from.as_str(),
                    target.to_string(),
                    dep_type.as_str(),
                    fmt_ts(Utc::now()),
                ],
            )?;
            touch(tx, &from)?;
            meta::record_event(
                tx,
                &from,
                "dep_added",
                &actor,
                None,
                Some(&format!("{} {target}", dep_type.as_str())),
            )?;
            if !owner.ephemeral {
                meta::mark_dirty(tx, &from)?;
            }
            Ok(())
        })
    }

    /// Remove the edge `from → to` of the given type.
    ///
    /// # Errors
    /// `NotFound` when the edge does not exist.
    pub fn remove_dependency(
        &mut self,
        from: &IssueId,
        to: &DepTarget,
        dep_type: DepType,
        actor: &str,
    ) -> Result<()> {
        let from = from.clone();
        let to = to.clone();
        let actor = actor.to_owned();
        self.transaction(|tx| {
            let Some(owner) = read_issue(tx, &from)? else {
                return Err(BeadsError::NotFound {
                    id: from.to_string(),
                });
            };
            let removed = tx.execute(
                "DELETE FROM dependencies
                 WHERE issue_id = ?1 AND target = ?2 AND dep_type = ?3",
                params![from.as_str(), to.to_string(), dep_type.as_str()],
            )?;
            if removed == 0 {
                return Err(BeadsError::NotFound {
                    id: format!("{from} -[{}]-> {to}", dep_type.as_str()),
                });
            }
            touch(tx, &from)?;
            meta::record_event(
                tx,
                &from,
                "dep_removed",
                &actor,
                Some(&format!("{} {to}", dep_type.as_str())),
                None,
            )?;
            if !owner.ephemeral {
                meta::mark_dirty(tx, &from)?;
            }
            Ok(())
        })
    }

    /// The issues `id` depends on (targets of its local edges), loaded in
    /// full. External targets are skipped.
    ///
    /// # Errors
    /// `NotFound` when `id` is absent.
    pub fn get_dependency_records(&self, id: &IssueId) -> Result<Vec<Issue>> {
        let issue = self.get(id)?;
        let mut out = Vec::new();
        for edge in &issue.dependencies {
            if let Some(target) = edge.target.local() {
                if let Some(dep) = self.try_get(target)? {
                    out.push(dep);
                }
            }
        }
        Ok(out)
    }
}

/// Bump `updated_at` on the edge's owning issue so edge changes win LWW.
fn touch(tx: &rusqlite::Transaction<'_>, id: &IssueId) -> Result<()> {
    tx.execute(
        "UPDATE issues SET updated_at = ?1 WHERE id = ?2",
        params![fmt_ts(Utc::now()), id.as_str()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
