//! Error types for the beads core.
//!
//! Defines [`BeadsError`], the unified error type for store, journal, and
//! sync operations. Error messages are designed to be agent-friendly: each
//! variant includes a clear description of what went wrong and actionable
//! guidance on how to fix it.

use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// BeadsError
// ---------------------------------------------------------------------------

/// Unified error type for beads core operations.
///
/// Each variant is designed to be self-contained: a caller receiving this
/// error should be able to understand what happened and what to do next
/// without additional context.
#[derive(Debug)]
pub enum BeadsError {
    /// A referenced issue or key does not exist.
    NotFound {
        /// The id or key that was looked up.
        id: String,
    },

    /// A partial id matched more than one issue.
    Ambiguous {
        /// The prefix that was given.
        prefix: String,
        /// The full ids that matched.
        matches: Vec<String>,
    },

    /// An operation would break a data-model invariant: an illegal status
    /// transition, a dependency cycle, or closing while blocked.
    InvariantViolated {
        /// Human-readable description of the violated invariant.
        detail: String,
    },

    /// A journal line or config file is malformed. Scoped to a single
    /// record; never fatal to the enclosing decode or import.
    Parse {
        /// Source of the malformed input (file path or description).
        origin: String,
        /// Line number, when line-scoped.
        line: Option<usize>,
        /// What was wrong.
        detail: String,
    },

    /// The three-way merge could not resolve automatically. Reserved for
    /// corrupt base snapshots; the merge policies resolve everything else.
    Conflict {
        /// Description of the unresolvable state.
        detail: String,
    },

    /// Another sync holds the workspace lock.
    SyncInProgress {
        /// Path to the lock file.
        lock_path: PathBuf,
    },

    /// Git reported a conflict outside the journal, or history diverged
    /// irrecoverably. Manual resolution required.
    SyncConflict {
        /// What git reported.
        detail: String,
    },

    /// A subprocess or network-like failure that may succeed on retry.
    Transient {
        /// What failed.
        detail: String,
    },

    /// A git command failed in a way that is not a merge conflict.
    Git {
        /// The git command that was run (e.g. `"git pull"`).
        command: String,
        /// Captured stderr from git.
        stderr: String,
    },

    /// Storage unreachable, disk full, or filesystem read-only. Aborts the
    /// operation and surfaces to the caller.
    Fatal {
        /// Description of the unrecoverable condition.
        detail: String,
    },

    /// The underlying SQLite store returned an error.
    Store(rusqlite::Error),

    /// An I/O error during a journal or workspace operation.
    Io(std::io::Error),

    /// The operation was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for BeadsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => {
                write!(
                    f,
                    "issue or key '{id}' not found.\n  \
                     To fix: check the id with `bd list`, or use a longer prefix."
                )
            }
            Self::Ambiguous { prefix, matches } => {
                write!(
                    f,
                    "id prefix '{prefix}' is ambiguous: matches {}.\n  \
                     To fix: give more characters of the id.",
                    matches.join(", ")
                )
            }
            Self::InvariantViolated { detail } => {
                write!(f, "operation rejected: {detail}")
            }
            Self::Parse {
                origin,
                line,
                detail,
            } => {
                write!(f, "parse error in {origin}")?;
                if let Some(n) = line {
                    write!(f, " line {n}")?;
                }
                write!(f, ": {detail}")
            }
            Self::Conflict { detail } => {
                write!(
                    f,
                    "merge could not resolve automatically: {detail}\n  \
                     To fix: run `bd doctor` to check for a corrupt base snapshot."
                )
            }
            Self::SyncInProgress { lock_path } => {
                write!(
                    f,
                    "another sync is in progress (lock held at {}).\n  \
                     To fix: wait for it to finish; a lock whose owner is dead \
                     is broken automatically on the next run.",
                    lock_path.display()
                )
            }
            Self::SyncConflict { detail } => {
                write!(
                    f,
                    "sync stopped: {detail}\n  \
                     To fix: resolve the git conflict manually, then run `bd sync` again."
                )
            }
            Self::Transient { detail } => write!(f, "transient failure: {detail}"),
            Self::Git { command, stderr } => {
                write!(f, "`{command}` failed")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::Fatal { detail } => {
                write!(
                    f,
                    "unrecoverable storage failure: {detail}\n  \
                     To fix: check disk space and filesystem permissions, \
                     then run `bd doctor`."
                )
            }
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for BeadsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BeadsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for BeadsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e)
    }
}

/// Convenience alias used throughout the core.
pub type Result<T, E = BeadsError> = std::result::Result<T, E>;

impl BeadsError {
    /// The process exit code this error maps to.
    ///
    /// Distinct codes for the conditions callers script against; everything
    /// else is 1.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => 2,
            Self::Ambiguous { .. } => 3,
            Self::InvariantViolated { .. } => 4,
            Self::SyncInProgress { .. } => 5,
            Self::SyncConflict { .. } => 6,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_the_id() {
        let err = BeadsError::NotFound {
            id: "bd-a1f2c3".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("bd-a1f2c3"));
        assert!(msg.contains("To fix"));
    }

    #[test]
    fn ambiguous_display_lists_matches() {
        let err = BeadsError::Ambiguous {
            prefix: "bd-a".to_owned(),
            matches: vec!["bd-a1f2c3aa".to_owned(), "bd-a9e8d7bb".to_owned()],
        };
        let msg = format!("{err}");
        assert!(msg.contains("bd-a1f2c3aa"));
        assert!(msg.contains("bd-a9e8d7bb"));
    }

    #[test]
    fn sync_in_progress_display_names_lock_path() {
        let err = BeadsError::SyncInProgress {
            lock_path: PathBuf::from("/tmp/ws/.beads/.sync.lock"),
        };
        let msg = format!("{err}");
        assert!(msg.contains(".sync.lock"));
    }

    #[test]
    fn exit_codes_are_distinct_for_scriptable_conditions() {
        let errs = [
            BeadsError::NotFound { id: "x".to_owned() },
            BeadsError::Ambiguous {
                prefix: "x".to_owned(),
                matches: vec![],
            },
            BeadsError::InvariantViolated {
                detail: String::new(),
            },
            BeadsError::SyncInProgress {
                lock_path: PathBuf::new(),
            },
            BeadsError::SyncConflict {
                detail: String::new(),
            },
        ];
        let codes: Vec<i32> = errs.iter().map(BeadsError::exit_code).collect();
        let mut deduped = codes.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(codes.len(), deduped.len(), "exit codes must not collide");
    }

    #[test]
    fn io_error_is_wrapped_with_source() {
        let err: BeadsError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs").into();
        assert!(format!("{err}").contains("read-only fs"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
