//! Journal codec: one JSON record per line, deterministic bytes, atomic
//! replacement on disk.
//!
//! Encoding rules:
//! - records sorted by id ascending, one per line, LF, trailing newline
//! - field order is fixed by struct declaration order, so identical record
//!   sets always produce identical bytes
//! - tombstones serialize as the minimal shape (id, `deleted_at`, reason)
//! - ephemeral records are never written
//!
//! Decoding is line-scoped: a malformed line is reported with its line
//! number and skipped, never fatal. Callers that need strictness check the
//! returned error list themselves.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{BeadsError, Result};
use crate::model::{Issue, IssueId};

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Minimal tombstone line shape.
#[derive(Serialize)]
struct TombstoneLine<'a> {
    id: &'a IssueId,
    deleted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delete_reason: Option<&'a String>,
}

/// Serialize a record set to canonical journal bytes.
///
/// Records are sorted by id; ephemeral records are dropped; tombstones take
/// the minimal shape. The output always ends with a newline (or is empty).
///
/// # Errors
/// Returns an error only if JSON serialization itself fails, which does not
/// happen for well-formed issues.
pub fn encode<'a, I>(records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Issue>,
{
    let mut sorted: Vec<&Issue> = records.into_iter().filter(|r| !r.ephemeral).collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut out = Vec::new();
    for record in sorted {
        let line = if let Some(deleted_at) = record.deleted_at {
            serde_json::to_vec(&TombstoneLine {
                id: &record.id,
                deleted_at,
                delete_reason: record.delete_reason.as_ref(),
            })
        } else {
            serde_json::to_vec(record)
        };
        let line = line.map_err(|e| BeadsError::Fatal {
            detail: format!("journal serialization failed for {}: {e}", record.id),
        })?;
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// A line the decoder had to skip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number in the journal.
    pub line: usize,
    /// Why the line could not be decoded.
    pub detail: String,
}

/// Decode journal bytes into records plus the lines that failed.
///
/// Empty lines are skipped silently; malformed lines are reported with
/// their line number and skipped. Records appear in file order; use
/// [`collapse`] for the last-writer-wins view.
#[must_use]
pub fn decode(bytes: &[u8]) -> (Vec<Issue>, Vec<SkippedLine>) {
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for (record, line_no) in LineDecoder::new(bytes) {
        match record {
            Ok(issue) => records.push(issue),
            Err(detail) => skipped.push(SkippedLine {
                line: line_no,
                detail,
            }),
        }
    }
    (records, skipped)
}

/// Lazy line-by-line decoder over any buffered reader.
///
/// Yields `(result, line_number)` pairs so large journals never need to be
/// materialized. The import engine consumes this directly.
pub struct LineDecoder<R> {
    reader: R,
    line_no: usize,
}

impl<R: BufRead> LineDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }
}

impl<R: BufRead> Iterator for LineDecoder<R> {
    type Item = (std::result::Result<Issue, String>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            self.line_no += 1;
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some((Err(format!("read failed: {e}")), self.line_no)),
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<Issue>(trimmed)
                .map(normalize_tombstone)
                .map_err(|e| e.to_string());
            return Some((parsed, self.line_no));
        }
    }
}

/// Tombstone lines carry only id + `deleted_at` + reason; fill the status
/// and timestamps from the deletion time so downstream comparisons work.
fn normalize_tombstone(mut issue: Issue) -> Issue {
    if let Some(deleted_at) = issue.deleted_at {
        issue.status = "tombstone".to_owned();
        if issue.created_at == DateTime::UNIX_EPOCH {
            issue.created_at = deleted_at;
        }
        if issue.updated_at == DateTime::UNIX_EPOCH {
            issue.updated_at = deleted_at;
        }
    }
    issue
}

/// Collapse decoded records into the last-writer-wins view: later lines for
/// the same id supersede earlier ones.
#[must_use]
pub fn collapse(records: Vec<Issue>) -> BTreeMap<IssueId, Issue> {
    let mut map = BTreeMap::new();
    for record in records {
        map.insert(record.id.clone(), record);
    }
    map
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

/// SHA-256 of the canonical journal bytes, lowercase hex.
///
/// This is the fingerprint stored in store metadata and compared by the
/// watermark oracle.
#[must_use]
pub fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

/// The tempfile path used by [`atomic_write`] for `path`.
///
/// Exposed so crash recovery can find and remove orphans.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Replace `path` with `bytes`: write `<path>.tmp`, fsync, rename over.
///
/// Writes through symlinks (the rename targets the link's destination) and
/// retains the existing file's mode bits when present. On any error the
/// partial tempfile is removed.
///
/// # Errors
/// Write errors are fatal to the operation; the original file is untouched.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    // Write through symlinks: resolve to the real destination first.
    let target = if path.exists() {
        fs::canonicalize(path)?
    } else {
        path.to_path_buf()
    };
    let tmp = temp_path(&target);

    let result = write_and_rename(&target, &tmp, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_and_rename(target: &Path, tmp: &Path, bytes: &[u8]) -> Result<()> {
    let existing_mode = fs::metadata(target).ok().map(|m| m.permissions());

    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Some(perms) = existing_mode {
        fs::set_permissions(tmp, perms)?;
    }

    fs::rename(tmp, target)?;

    // Persist the rename itself.
    if let Some(dir) = target.parent() {
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
