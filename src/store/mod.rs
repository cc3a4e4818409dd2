//! The indexed store: transactional CRUD over issues, dependencies, labels,
//! comments, events, config, and metadata, backed by SQLite.
//!
//! The store owns the authoritative record graph for its workspace. It never
//! talks to git or the filesystem outside its own database file; the flush
//! and import engines drive it through the operations defined here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::{BeadsError, Result};
use crate::model::{Comment, DepEdge, DepTarget, DepType, Issue, IssueId, StateRegistry};

pub mod deps;
pub mod issues;
pub mod meta;
pub mod schema;

pub use issues::{FieldDiff, NewIssue, SearchFilter};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to one workspace's database.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the
    /// schema. Configures WAL journaling, a busy timeout, and foreign keys.
    ///
    /// # Errors
    /// Fails if the file cannot be opened or the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// An in-memory store, used by tests and JSONL-only mode.
    ///
    /// # Errors
    /// Fails only if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        // journal_mode returns a row, so it goes through query_row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    /// The database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a single transaction; commit on `Ok`, roll back on
    /// `Err`. All invariants are checked before the commit returns.
    ///
    /// # Errors
    /// Propagates the closure's error after rolling back.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Read-only access to the underlying connection.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// The per-workspace status/type registry, built from store config.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn registry(&self) -> Result<StateRegistry> {
        let statuses = meta::get_config(&self.conn, "status.custom")?.unwrap_or_default();
        let types = meta::get_config(&self.conn, "type.custom")?.unwrap_or_default();
        Ok(StateRegistry::new(&statuses, &types))
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Serialize a timestamp as RFC 3339 UTC with nanosecond precision.
/// Fixed-width, so string comparison orders correctly.
#[must_use]
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BeadsError::Parse {
            origin: "store timestamp".to_owned(),
            line: None,
            detail: format!("{s:?}: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Load a full issue (row + labels + dependencies + comments), or `None`.
pub(crate) fn read_issue(conn: &Connection, id: &IssueId) -> Result<Option<Issue>> {
    let row = conn
        .query_row(
            "SELECT id, title, description, design, notes, acceptance_criteria,
                    status, priority, issue_type, assignee, created_by,
                    external_ref, source_repo, created_at, updated_at,
                    closed_at, close_reason, ephemeral, deleted_at,
                    delete_reason, extra
             FROM issues WHERE id = ?1",
            [id.as_str()],
            map_issue_row,
        )
        .optional()?;
    let Some(mut issue) = row.transpose()? else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT label FROM labels WHERE issue_id = ?1 ORDER BY label")?;
    issue.labels = stmt
        .query_map([id.as_str()], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT target, dep_type FROM dependencies WHERE issue_id = ?1 ORDER BY target",
    )?;
    let edges = stmt.query_map([id.as_str()], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    for edge in edges {
        let (target, dep_type) = edge?;
        issue.dependencies.insert(DepEdge {
            target: DepTarget::parse(&target).map_err(|e| invalid_row(&e.to_string()))?,
            dep_type: dep_type
                .parse::<DepType>()
                .map_err(|e| invalid_row(&e.to_string()))?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT author, text, created_at FROM comments
         WHERE issue_id = ?1 ORDER BY created_at, id",
    )?;
    let comments = stmt.query_map([id.as_str()], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
        ))
    })?;
    for comment in comments {
        let (author, text, created_at) = comment?;
        issue.comments.push(Comment {
            author,
            text,
            created_at: parse_ts(&created_at)?,
        });
    }

    Ok(Some(issue))
}

type IssueRowResult = std::result::Result<Result<Issue>, rusqlite::Error>;

#[allow(clippy::too_many_lines)]
fn map_issue_row(row: &rusqlite::Row<'_>) -> IssueRowResult {
    let id: String = row.get(0)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let closed_at: Option<String> = row.get(15)?;
    let deleted_at: Option<String> = row.get(18)?;
    let extra: String = row.get(20)?;

    let build = || -> Result<Issue> {
        Ok(Issue {
            id: IssueId::new(&id).map_err(|e| invalid_stored(&e.to_string()))?,
            title: row.get(1).map_err(BeadsError::Store)?,
            description: row.get(2).map_err(BeadsError::Store)?,
            design: row.get(3).map_err(BeadsError::Store)?,
            notes: row.get(4).map_err(BeadsError::Store)?,
            acceptance_criteria: row.get(5).map_err(BeadsError::Store)?,
            status: row.get(6).map_err(BeadsError::Store)?,
            priority: row.get(7).map_err(BeadsError::Store)?,
            issue_type: row.get(8).map_err(BeadsError::Store)?,
            assignee: row.get(9).map_err(BeadsError::Store)?,
            created_by: row.get(10).map_err(BeadsError::Store)?,
            external_ref: row.get(11).map_err(BeadsError::Store)?,
            source_repo: row.get(12).map_err(BeadsError::Store)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
            close_reason: row.get(16).map_err(BeadsError::Store)?,
            ephemeral: row.get(17).map_err(BeadsError::Store)?,
            deleted_at: deleted_at.as_deref().map(parse_ts).transpose()?,
            delete_reason: row.get(19).map_err(BeadsError::Store)?,
            labels: std::collections::BTreeSet::new(),
            dependencies: std::collections::BTreeSet::new(),
            comments: Vec::new(),
            extra: serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&extra)
                .unwrap_or_default(),
        })
    };
    Ok(build())
}

fn invalid_row(detail: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, detail.to_owned(), rusqlite::types::Type::Text)
}

fn invalid_stored(detail: &str) -> BeadsError {
    BeadsError::Fatal {
        detail: format!("corrupt stored row: {detail}"),
    }
}

/// Upsert the full issue (row + labels + dependencies + comments).
///
/// Replaces the side tables wholesale; the caller decides merge semantics
/// before calling.
pub(crate) fn write_issue(tx: &Transaction<'_>, issue: &Issue) -> Result<()> {
    let extra = serde_json::to_string(&issue.extra).map_err(|e| BeadsError::Fatal {
        detail: format!("extra map serialization failed: {e}"),
    })?;
    tx.execute(
        "INSERT INTO issues (id, title, description, design, notes,
             acceptance_criteria, status, priority, issue_type, assignee,
             created_by, external_ref, source_repo, created_at, updated_at,
             closed_at, close_reason, ephemeral, deleted_at, delete_reason, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
             ?15, ?16, ?17, ?18, ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             description = excluded.description,
             design = excluded.design,
             notes = excluded.notes,
             acceptance_criteria = excluded.acceptance_criteria,
             status = excluded.status,
             priority = excluded.priority,
             issue_type = excluded.issue_type,
             assignee = excluded.assignee,
             created_by = excluded.created_by,
             external_ref = excluded.external_ref,
             source_repo = excluded.source_repo,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at,
             closed_at = excluded.closed_at,
             close_reason = excluded.close_reason,
             ephemeral = excluded.ephemeral,
             deleted_at = excluded.deleted_at,
             delete_reason = excluded.delete_reason,
             extra = excluded.extra",
        params![
            issue.id.as_str(),
            issue.title,
            issue.description,
            issue.design,
            issue.notes,
            issue.acceptance_criteria,
            issue.status,
            issue.priority,
            issue.issue_type,
            issue.assignee,
            issue.created_by,
            issue.external_ref,
            issue.source_repo,
            fmt_ts(issue.created_at),
            fmt_ts(issue.updated_at),
            issue.closed_at.map(fmt_ts),
            issue.close_reason,
            issue.ephemeral,
            issue.deleted_at.map(fmt_ts),
            issue.delete_reason,
            extra,
        ],
    )?;

    tx.execute("DELETE FROM labels WHERE issue_id = ?1", [issue.id.as_str()])?;
    for label in &issue.labels {
        tx.execute(
            "INSERT INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![issue.id.as_str(), label],
        )?;
    }

    tx.execute(
        "DELETE FROM dependencies WHERE issue_id = ?1",
        [issue.id.as_str()],
    )?;
    for edge in &issue.dependencies {
        tx.execute(
            "INSERT INTO dependencies (issue_id, target, dep_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                issue.id.as_str(),
                edge.target.to_string(),
                edge.dep_type.as_str(),
                fmt_ts(issue.updated_at),
            ],
        )?;
    }

    tx.execute(
        "DELETE FROM comments WHERE issue_id = ?1",
        [issue.id.as_str()],
    )?;
    for comment in &issue.comments {
        tx.execute(
            "INSERT INTO comments (issue_id, author, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                issue.id.as_str(),
                comment.author,
                comment.text,
                fmt_ts(comment.created_at),
            ],
        )?;
    }

    Ok(())
}

/// All issue ids in the store, tombstones included.
pub(crate) fn all_ids(conn: &Connection) -> Result<Vec<IssueId>> {
    let mut stmt = conn.prepare("SELECT id FROM issues ORDER BY id")?;
    let ids = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for id in ids {
        out.push(IssueId::new(&id?).map_err(|e| invalid_stored(&e.to_string()))?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap()
    }

    #[test]
    fn fmt_ts_keeps_nanoseconds_and_sorts_lexicographically() {
        let earlier = fmt_ts(ts());
        let later = fmt_ts(ts() + chrono::Duration::nanoseconds(1));
        assert!(earlier.contains("123456789"));
        assert!(earlier < later);
        assert_eq!(parse_ts(&earlier).unwrap(), ts());
    }

    #[test]
    fn write_then_read_round_trips_full_issue() {
        let mut store = Store::open_in_memory().unwrap();
        let mut issue = Issue::new(IssueId::new("bd-aa1bb2").unwrap(), "round trip", ts());
        issue.labels.insert("backend".to_owned());
        issue.dependencies.insert(DepEdge::local(
            IssueId::new("bd-cc3dd4").unwrap(),
            DepType::Blocks,
        ));
        issue.comments.push(Comment {
            author: "alice".to_owned(),
            text: "looks good".to_owned(),
            created_at: ts(),
        });
        issue
            .extra
            .insert("future".to_owned(), serde_json::Value::Bool(true));

        store
            .transaction(|tx| write_issue(tx, &issue))
            .unwrap();
        let got = read_issue(store.conn(), &issue.id).unwrap().unwrap();
        assert_eq!(got, issue);
    }

    #[test]
    fn read_missing_issue_is_none() {
        let store = Store::open_in_memory().unwrap();
        let got = read_issue(store.conn(), &IssueId::new("bd-zz9").unwrap()).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let mut store = Store::open_in_memory().unwrap();
        let issue = Issue::new(IssueId::new("bd-aa1bb2").unwrap(), "doomed", ts());
        let result: Result<()> = store.transaction(|tx| {
            write_issue(tx, &issue)?;
            Err(BeadsError::Cancelled)
        });
        assert!(result.is_err());
        assert!(read_issue(store.conn(), &issue.id).unwrap().is_none());
    }
}
