//! Config, metadata, dirty-set, and event operations.
//!
//! `config` is user-visible project state (issue prefix, custom statuses,
//! integration keys). `metadata` is internal: schema version, journal
//! content hash, clone identity, process fingerprint. Both are untyped
//! key→string maps.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::model::IssueId;

use super::{Store, fmt_ts};

// Metadata keys used by the core.
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_BD_VERSION: &str = "bd_version";
pub const META_JOURNAL_HASH: &str = "journal_content_hash";
pub const META_JOURNAL_MTIME_NS: &str = "journal_mtime_ns";
pub const META_REPO_ID: &str = "repo_id";
pub const META_CLONE_ID: &str = "clone_id";

// ---------------------------------------------------------------------------
// Key/value maps
// ---------------------------------------------------------------------------

pub(crate) fn get_kv(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    let sql = format!("SELECT value FROM {table} WHERE key = ?1");
    Ok(conn
        .query_row(&sql, [key], |row| row.get(0))
        .optional()?)
}

pub(crate) fn set_kv(conn: &Connection, table: &str, key: &str, value: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value"
    );
    conn.execute(&sql, params![key, value])?;
    Ok(())
}

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    get_kv(conn, "config", key)
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    set_kv(conn, "config", key, value)
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    get_kv(conn, "metadata", key)
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    set_kv(conn, "metadata", key, value)
}

// ---------------------------------------------------------------------------
// Dirty set
// ---------------------------------------------------------------------------

/// Record that `id` changed since the last flush.
pub fn mark_dirty(conn: &Connection, id: &IssueId) -> Result<()> {
    conn.execute(
        "INSERT INTO dirty_issues (issue_id, marked_at) VALUES (?1, ?2)
         ON CONFLICT(issue_id) DO UPDATE SET marked_at = excluded.marked_at",
        params![id.as_str(), fmt_ts(Utc::now())],
    )?;
    Ok(())
}

/// All ids awaiting a flush.
pub fn dirty_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT issue_id FROM dirty_issues ORDER BY issue_id")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Whether any flush is pending.
pub fn has_dirty(conn: &Connection) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM dirty_issues", [], |r| r.get(0))?;
    Ok(n > 0)
}

/// Empty the dirty set. Called by the flush engine after a successful
/// journal write, inside the same transaction that stores the new hash.
pub fn clear_dirty(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM dirty_issues", [])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Record a mutation event for the audit trail. Events are store-local and
/// never exported to the journal.
pub fn record_event(
    conn: &Connection,
    id: &IssueId,
    event_type: &str,
    actor: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.as_str(),
            event_type,
            actor,
            old_value,
            new_value,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store wrappers
// ---------------------------------------------------------------------------

impl Store {
    /// Read a user-visible config key.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        get_config(self.conn(), key)
    }

    /// Set a user-visible config key.
    ///
    /// # Errors
    /// Fails on a store write error.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        set_config(self.conn(), key, value)
    }

    /// Read an internal metadata key.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        get_metadata(self.conn(), key)
    }

    /// Set an internal metadata key.
    ///
    /// # Errors
    /// Fails on a store write error.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata(self.conn(), key, value)
    }

    /// Ids changed since the last flush.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn dirty_ids(&self) -> Result<Vec<String>> {
        dirty_ids(self.conn())
    }

    /// Whether a flush is pending.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn has_dirty(&self) -> Result<bool> {
        has_dirty(self.conn())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
