//! Issue CRUD: create with content-derived ids, transactional field diffs,
//! tombstoning deletes, partial-id resolution, and search.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, params};
use sha2::{Digest, Sha256};

use crate::error::{BeadsError, Result};
use crate::model::{DepEdge, DepType, Issue, IssueId};

use super::{Store, fmt_ts, meta, read_issue, write_issue};

// ---------------------------------------------------------------------------
// NewIssue
// ---------------------------------------------------------------------------

/// Parameters for creating an issue. The store assigns the identifier.
#[derive(Clone, Debug, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub design: String,
    pub notes: String,
    pub acceptance_criteria: String,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub assignee: Option<String>,
    pub external_ref: Option<String>,
    pub labels: BTreeSet<String>,
    /// Create as a hierarchical child of this issue.
    pub parent: Option<IssueId>,
    /// Link back to the issue this work was discovered from; the new issue
    /// inherits its `source_repo`.
    pub discovered_from: Option<IssueId>,
    pub source_repo: Option<String>,
    /// Ephemeral issues live only in the store, never in the journal.
    pub ephemeral: bool,
}

// ---------------------------------------------------------------------------
// FieldDiff
// ---------------------------------------------------------------------------

/// A partial update. `None` fields are untouched; `Some` fields are applied.
/// Nullable scalars use a nested option: `Some(None)` clears the field.
#[derive(Clone, Debug, Default)]
pub struct FieldDiff {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design: Option<String>,
    pub notes: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub status: Option<String>,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub assignee: Option<Option<String>>,
    pub external_ref: Option<Option<String>>,
    pub close_reason: Option<String>,
    pub add_labels: BTreeSet<String>,
    pub remove_labels: BTreeSet<String>,
    /// Permit closing even while a blocks-dependency is still open.
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Filters for [`Store::search`]. All present filters must match.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    pub status: Option<String>,
    pub priority: Option<u8>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    /// Case-insensitive substring over title and description.
    pub text: Option<String>,
    /// Only issues updated at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    /// Only open issues whose blocks-dependencies are all closed.
    pub ready: bool,
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl Store {
    /// Create an issue, assigning a content-derived identifier (or the next
    /// child index when `parent` is set). Records a creation event and
    /// marks the issue dirty.
    ///
    /// # Errors
    /// `InvariantViolated` for an unknown type or bad priority; store errors
    /// otherwise.
    pub fn create(&mut self, new: NewIssue, actor: &str) -> Result<Issue> {
        let registry = self.registry()?;
        let issue_type = new.issue_type.clone().unwrap_or_else(|| "task".to_owned());
        if !registry.valid_type(&issue_type) {
            return Err(BeadsError::InvariantViolated {
                detail: format!("unknown issue type '{issue_type}'"),
            });
        }
        let priority = new.priority.unwrap_or(2);
        if priority > 4 {
            return Err(BeadsError::InvariantViolated {
                detail: format!("priority {priority} out of range 0-4"),
            });
        }

        let prefix = self
            .get_config("issue-prefix")?
            .unwrap_or_else(|| "bd".to_owned());
        let now = Utc::now();
        let actor_owned = actor.to_owned();

        self.transaction(|tx| {
            let id = match &new.parent {
                Some(parent) => next_child_id(tx, parent)?,
                None => derive_id(tx, &prefix, &new.title, &new.description, &actor_owned, now)?,
            };

            let mut issue = Issue::new(id, new.title.clone(), now);
            issue.description.clone_from(&new.description);
            issue.design.clone_from(&new.design);
            issue.notes.clone_from(&new.notes);
            issue.acceptance_criteria.clone_from(&new.acceptance_criteria);
            issue.priority = priority;
            issue.issue_type.clone_from(&issue_type);
            issue.assignee.clone_from(&new.assignee);
            issue.external_ref.clone_from(&new.external_ref);
            issue.labels.clone_from(&new.labels);
            issue.created_by = Some(actor_owned.clone());
            issue.ephemeral = new.ephemeral;
            issue.source_repo.clone_from(&new.source_repo);

            if let Some(parent) = &new.parent {
                if read_issue(tx, parent)?.is_none() {
                    return Err(BeadsError::NotFound {
                        id: parent.to_string(),
                    });
                }
                issue
                    .dependencies
                    .insert(DepEdge::local(parent.clone(), DepType::ParentChild));
            }
            if let Some(origin) = &new.discovered_from {
                let Some(origin_issue) = read_issue(tx, origin)? else {
                    return Err(BeadsError::NotFound {
                        id: origin.to_string(),
                    });
                };
                issue
                    .dependencies
                    .insert(DepEdge::local(origin.clone(), DepType::DiscoveredFrom));
                if issue.source_repo.is_none() {
                    issue.source_repo = origin_issue.source_repo;
                }
            }

            write_issue(tx, &issue)?;
            meta::record_event(tx, &issue.id, "created", &actor_owned, None, None)?;
            if !issue.ephemeral {
                meta::mark_dirty(tx, &issue.id)?;
            }
            Ok(issue)
        })
    }

    /// Fetch an issue or fail with `NotFound`.
    ///
    /// # Errors
    /// `NotFound` when absent.
    pub fn get(&self, id: &IssueId) -> Result<Issue> {
        read_issue(self.conn(), id)?.ok_or_else(|| BeadsError::NotFound {
            id: id.to_string(),
        })
    }

    /// Fetch an issue, `None` when absent.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn try_get(&self, id: &IssueId) -> Result<Option<Issue>> {
        read_issue(self.conn(), id)
    }

    /// Resolve a partial id to the unique full id extending it.
    ///
    /// An exact match wins even when longer ids share the prefix.
    ///
    /// # Errors
    /// `NotFound` when nothing matches, `Ambiguous` when several do.
    pub fn resolve_partial_id(&self, prefix: &str) -> Result<IssueId> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM issues
             WHERE id LIKE ?1 || '%' AND deleted_at IS NULL
             ORDER BY id",
        )?;
        let matches: Vec<String> = stmt
            .query_map([prefix], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        if matches.iter().any(|m| m == prefix) {
            return IssueId::new(prefix).map_err(|e| BeadsError::Fatal {
                detail: format!("corrupt stored id: {e}"),
            });
        }
        match matches.as_slice() {
            [] => Err(BeadsError::NotFound {
                id: prefix.to_owned(),
            }),
            [only] => IssueId::new(only).map_err(|e| BeadsError::Fatal {
                detail: format!("corrupt stored id: {e}"),
            }),
            _ => Err(BeadsError::Ambiguous {
                prefix: prefix.to_owned(),
                matches,
            }),
        }
    }

    /// Apply a field diff. Validates status/type against the registry,
    /// enforces the closed-while-blocked invariant, bumps `updated_at`,
    /// marks dirty, and records one event per changed field.
    ///
    /// # Errors
    /// `NotFound` for missing or tombstoned ids, `InvariantViolated` for
    /// illegal transitions.
    #[allow(clippy::too_many_lines)]
    pub fn update(&mut self, id: &IssueId, diff: FieldDiff, actor: &str) -> Result<Issue> {
        let registry = self.registry()?;
        let actor = actor.to_owned();
        let id = id.clone();
        self.transaction(|tx| {
            let Some(mut issue) = read_issue(tx, &id)? else {
                return Err(BeadsError::NotFound { id: id.to_string() });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::NotFound { id: id.to_string() });
            }

            let mut events: Vec<(&str, String, String)> = Vec::new();
            let mut set_scalar = |field: &'static str, slot: &mut String, v: Option<String>| {
                if let Some(v) = v {
                    if *slot != v {
                        events.push((field, slot.clone(), v.clone()));
                        *slot = v;
                    }
                }
            };
            set_scalar("title", &mut issue.title, diff.title);
            set_scalar("description", &mut issue.description, diff.description);
            set_scalar("design", &mut issue.design, diff.design);
            set_scalar("notes", &mut issue.notes, diff.notes);
            set_scalar(
                "acceptance_criteria",
                &mut issue.acceptance_criteria,
                diff.acceptance_criteria,
            );

            if let Some(priority) = diff.priority {
                if priority > 4 {
                    return Err(BeadsError::InvariantViolated {
                        detail: format!("priority {priority} out of range 0-4"),
                    });
                }
                if priority != issue.priority {
                    events.push(("priority", issue.priority.to_string(), priority.to_string()));
                    issue.priority = priority;
                }
            }

            if let Some(issue_type) = diff.issue_type {
                if !registry.valid_type(&issue_type) {
                    return Err(BeadsError::InvariantViolated {
                        detail: format!("unknown issue type '{issue_type}'"),
                    });
                }
                if issue_type != issue.issue_type {
                    events.push(("type", issue.issue_type.clone(), issue_type.clone()));
                    issue.issue_type = issue_type;
                }
            }

            if let Some(assignee) = diff.assignee {
                if assignee != issue.assignee {
                    events.push((
                        "assignee",
                        issue.assignee.clone().unwrap_or_default(),
                        assignee.clone().unwrap_or_default(),
                    ));
                    issue.assignee = assignee;
                }
            }
            if let Some(external_ref) = diff.external_ref {
                if external_ref != issue.external_ref {
                    events.push((
                        "external_ref",
                        issue.external_ref.clone().unwrap_or_default(),
                        external_ref.clone().unwrap_or_default(),
                    ));
                    issue.external_ref = external_ref;
                }
            }

            if let Some(status) = diff.status {
                if !registry.valid_status(&status) {
                    return Err(BeadsError::InvariantViolated {
                        detail: format!("unknown status '{status}'"),
                    });
                }
                if status != issue.status {
                    if status == "closed" && !diff.force {
                        check_blocks_closed(tx, &issue)?;
                    }
                    events.push(("status", issue.status.clone(), status.clone()));
                    if status == "closed" {
                        issue.closed_at = Some(Utc::now());
                        issue.close_reason = diff.close_reason.clone();
                    } else if issue.status == "closed" {
                        // Reopening clears the close bookkeeping.
                        issue.closed_at = None;
                        issue.close_reason = None;
                    }
                    issue.status = status;
                }
            }

            for label in &diff.add_labels {
                if issue.labels.insert(label.clone()) {
                    events.push(("label_added", String::new(), label.clone()));
                }
            }
            for label in &diff.remove_labels {
                if issue.labels.remove(label) {
                    events.push(("label_removed", label.clone(), String::new()));
                }
            }

            if events.is_empty() {
                return Ok(issue);
            }

            issue.updated_at = Utc::now();
            write_issue(tx, &issue)?;
            for (field, old, new) in events {
                meta::record_event(tx, &issue.id, field, &actor, Some(&old), Some(&new))?;
            }
            if !issue.ephemeral {
                meta::mark_dirty(tx, &issue.id)?;
            }
            Ok(issue)
        })
    }

    /// Soft-delete an issue into a tombstone. With `cascade`, children
    /// linked by parent-child edges are tombstoned too; without it, the
    /// delete fails if any live issue still depends on this one.
    ///
    /// Returns the ids that were tombstoned.
    ///
    /// # Errors
    /// `NotFound` for missing ids, `InvariantViolated` when dependents
    /// exist and `cascade` is false.
    pub fn delete(
        &mut self,
        id: &IssueId,
        actor: &str,
        cascade: bool,
        reason: Option<String>,
    ) -> Result<Vec<IssueId>> {
        let actor = actor.to_owned();
        let id = id.clone();
        self.transaction(|tx| {
            if read_issue(tx, &id)?.is_none() {
                return Err(BeadsError::NotFound { id: id.to_string() });
            }

            let mut doomed = vec![id.clone()];
            if cascade {
                let mut frontier = vec![id.clone()];
                while let Some(current) = frontier.pop() {
                    for child in children_of(tx, &current)? {
                        if !doomed.contains(&child) {
                            doomed.push(child.clone());
                            frontier.push(child);
                        }
                    }
                }
            } else {
                let dependents = dependents_of(tx, &id)?;
                if !dependents.is_empty() {
                    return Err(BeadsError::InvariantViolated {
                        detail: format!(
                            "{} still depends on {id}; delete with cascade or remove the \
                             dependency first",
                            dependents
                                .iter()
                                .map(IssueId::as_str)
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    });
                }
            }

            let now = Utc::now();
            for target in &doomed {
                let tombstone = Issue::tombstone(target.clone(), now, reason.clone());
                write_issue(tx, &tombstone)?;
                // Edges into the deleted issue go with it.
                tx.execute(
                    "DELETE FROM dependencies WHERE target = ?1",
                    [target.as_str()],
                )?;
                meta::record_event(tx, target, "deleted", &actor, None, reason.as_deref())?;
                meta::mark_dirty(tx, target)?;
            }
            Ok(doomed)
        })
    }

    /// All issues, tombstones included. Feeds the flush engine.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn all_issues(&self) -> Result<Vec<Issue>> {
        let ids = super::all_ids(self.conn())?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(issue) = read_issue(self.conn(), &id)? {
                out.push(issue);
            }
        }
        Ok(out)
    }

    /// Search live issues by filter. Tombstones never match.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<Issue>> {
        let all = self.all_issues()?;
        let mut out = Vec::new();
        for issue in all {
            if issue.is_tombstone() || !matches_filter(&issue, filter) {
                continue;
            }
            if filter.ready && !self.is_ready(&issue)? {
                continue;
            }
            out.push(issue);
        }
        Ok(out)
    }

    /// Whether all blocks-dependencies of `issue` are closed.
    fn is_ready(&self, issue: &Issue) -> Result<bool> {
        if issue.status != "open" && issue.status != "in_progress" {
            return Ok(false);
        }
        for edge in &issue.dependencies {
            if edge.dep_type != DepType::Blocks {
                continue;
            }
            let Some(target) = edge.target.local() else {
                continue;
            };
            if let Some(dep) = read_issue(self.conn(), target)? {
                if !dep.is_tombstone() && dep.status != "closed" {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Rewrite an issue's primary key, cascading across dependency, label,
    /// comment, event, and dirty tables atomically. Used only by one-shot
    /// migration utilities.
    ///
    /// # Errors
    /// `NotFound` if `old` is absent; `InvariantViolated` if `new` exists.
    pub fn update_issue_id(&mut self, old: &IssueId, new: &IssueId) -> Result<()> {
        let (old, new) = (old.clone(), new.clone());
        self.transaction(|tx| {
            if read_issue(tx, &old)?.is_none() {
                return Err(BeadsError::NotFound {
                    id: old.to_string(),
                });
            }
            if read_issue(tx, &new)?.is_some() {
                return Err(BeadsError::InvariantViolated {
                    detail: format!("id {new} already exists"),
                });
            }
            tx.execute(
                "UPDATE issues SET id = ?1 WHERE id = ?2",
                params![new.as_str(), old.as_str()],
            )?;
            for (table, column) in [
                ("dependencies", "issue_id"),
                ("dependencies", "target"),
                ("labels", "issue_id"),
                ("comments", "issue_id"),
                ("events", "issue_id"),
                ("dirty_issues", "issue_id"),
            ] {
                let sql = format!("UPDATE {table} SET {column} = ?1 WHERE {column} = ?2");
                tx.execute(&sql, params![new.as_str(), old.as_str()])?;
            }
            Ok(())
        })
    }

    /// Add a comment. Comments are append-only and merge by union.
    ///
    /// # Errors
    /// `NotFound` for missing or tombstoned ids.
    pub fn add_comment(&mut self, id: &IssueId, author: &str, text: &str) -> Result<()> {
        let id = id.clone();
        let (author, text) = (author.to_owned(), text.to_owned());
        self.transaction(|tx| {
            let Some(issue) = read_issue(tx, &id)? else {
                return Err(BeadsError::NotFound { id: id.to_string() });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::NotFound { id: id.to_string() });
            }
            tx.execute(
                "INSERT INTO comments (issue_id, author, text, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), author, text, fmt_ts(Utc::now())],
            )?;
            if !issue.ephemeral {
                meta::mark_dirty(tx, &id)?;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Id derivation
// ---------------------------------------------------------------------------

/// Derive a hash id: first 8 hex chars of
/// `SHA-256(title|description|actor|created_at_ns|nonce)`. Collisions and
/// all-digit suffixes re-roll with an incremented nonce so suffixes stay
/// distinguishable from numeric legacy ids.
fn derive_id(
    conn: &Connection,
    prefix: &str,
    title: &str,
    description: &str,
    actor: &str,
    created_at: DateTime<Utc>,
) -> Result<IssueId> {
    let created_ns = created_at.timestamp_nanos_opt().unwrap_or_default();
    for nonce in 0u32.. {
        let mut hasher = Sha256::new();
        hasher.update(format!("{title}|{description}|{actor}|{created_ns}|{nonce}"));
        let digest = format!("{:x}", hasher.finalize());
        let suffix = &digest[..8];
        if suffix.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let id = IssueId::new(&format!("{prefix}-{suffix}")).map_err(|e| BeadsError::Fatal {
            detail: format!("derived id failed validation: {e}"),
        })?;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?1)",
                [id.as_str()],
                |r| r.get(0),
            )?;
        if !exists {
            return Ok(id);
        }
    }
    unreachable!("nonce space exhausted")
}

/// The next unused positive child index under `parent`.
fn next_child_id(conn: &Connection, parent: &IssueId) -> Result<IssueId> {
    let pattern = format!("{parent}.%");
    let mut stmt = conn.prepare("SELECT id FROM issues WHERE id LIKE ?1")?;
    let rows: Vec<String> = stmt
        .query_map([&pattern], |r| r.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    let parent_dot = format!("{parent}.");
    let max_k = rows
        .iter()
        .filter_map(|id| id.strip_prefix(&parent_dot))
        // Direct children only; grandchildren carry another dot.
        .filter(|rest| !rest.contains('.'))
        .filter_map(|rest| rest.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    Ok(parent.child(max_k + 1))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Live issues with a parent-child edge targeting `id`.
fn children_of(conn: &Connection, id: &IssueId) -> Result<Vec<IssueId>> {
    issues_depending_on(conn, id, Some(DepType::ParentChild))
}

/// Live issues with any edge targeting `id`.
fn dependents_of(conn: &Connection, id: &IssueId) -> Result<Vec<IssueId>> {
    issues_depending_on(conn, id, None)
}

fn issues_depending_on(
    conn: &Connection,
    id: &IssueId,
    dep_type: Option<DepType>,
) -> Result<Vec<IssueId>> {
    let mut sql = "SELECT d.issue_id FROM dependencies d
         JOIN issues i ON i.id = d.issue_id
         WHERE d.target = ?1 AND i.deleted_at IS NULL"
        .to_owned();
    if dep_type.is_some() {
        sql.push_str(" AND d.dep_type = ?2");
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<String> = if let Some(t) = dep_type {
        stmt.query_map(params![id.as_str(), t.as_str()], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?
    } else {
        stmt.query_map([id.as_str()], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?
    };
    let mut out = Vec::new();
    for s in rows {
        out.push(IssueId::new(&s).map_err(|e| BeadsError::Fatal {
            detail: format!("corrupt stored id: {e}"),
        })?);
    }
    Ok(out)
}

/// Reject a close while a blocks-dependency is still open.
fn check_blocks_closed(tx: &Transaction<'_>, issue: &Issue) -> Result<()> {
    for edge in &issue.dependencies {
        if edge.dep_type != DepType::Blocks {
            continue;
        }
        let Some(target) = edge.target.local() else {
            continue;
        };
        if let Some(dep) = read_issue(tx, target)? {
            if !dep.is_tombstone() && dep.status != "closed" {
                return Err(BeadsError::InvariantViolated {
                    detail: format!(
                        "cannot close {} while it is blocked by open issue {target}; \
                         close the blocker first or pass --force",
                        issue.id
                    ),
                });
            }
        }
    }
    Ok(())
}

fn matches_filter(issue: &Issue, filter: &SearchFilter) -> bool {
    if let Some(status) = &filter.status {
        if issue.status != *status {
            return false;
        }
    }
    if let Some(priority) = filter.priority {
        if issue.priority != priority {
            return false;
        }
    }
    if let Some(assignee) = &filter.assignee {
        if issue.assignee.as_deref() != Some(assignee.as_str()) {
            return false;
        }
    }
    if let Some(label) = &filter.label {
        if !issue.labels.contains(label) {
            return false;
        }
    }
    if let Some(text) = &filter.text {
        let needle = text.to_lowercase();
        if !issue.title.to_lowercase().contains(&needle)
            && !issue.description.to_lowercase().contains(&needle)
        {
            return false;
        }
    }
    if let Some(since) = filter.updated_since {
        if issue.updated_at < since {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
