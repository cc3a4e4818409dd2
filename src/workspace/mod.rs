//! Workspace resolution.
//!
//! Locates the `.beads/` directory that anchors a project's state: walk the
//! current directory upward, honor the `BEADS_DIR` override, follow a
//! `redirect` file one level, and resolve worktrees against the main
//! repository root. Reports whether the workspace is co-located with the
//! caller's git repository or external to it; the distinction drives where
//! sync commits land.
//!
//! All paths are canonicalized (symlinks resolved) before comparison, so
//! `/var` vs `/private/var` style aliases never split a workspace in two.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BeadsError, Result};
use crate::git::{Git, canonical};

pub mod lock;

/// The workspace directory name.
pub const WORKSPACE_DIR: &str = ".beads";

/// The redirect file name inside a workspace.
pub const REDIRECT_FILE: &str = "redirect";

/// Environment override for the workspace directory.
pub const ENV_BEADS_DIR: &str = "BEADS_DIR";

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// A resolved workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    /// Canonical path of the `.beads/` directory.
    pub dir: PathBuf,
    /// Whether a `redirect` file was followed to get here (diagnostics).
    pub redirected: bool,
    /// Where the workspace sits relative to the caller's repository.
    pub location: RepoLocation,
}

/// The git repository that owns a workspace, relative to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepoLocation {
    /// The workspace lives in the same repository as the caller's cwd.
    CoLocated {
        /// The shared repository root.
        root: PathBuf,
    },
    /// The workspace lives in a different repository; sync commits land
    /// there and the caller's project repo sees nothing.
    External {
        /// The external repository root.
        root: PathBuf,
    },
    /// The workspace directory is not under any git repository; sync is
    /// unavailable but local operations work.
    Unversioned,
}

impl Workspace {
    /// The repository root git commands should target, if any.
    #[must_use]
    pub fn repo_root(&self) -> Option<&Path> {
        match &self.location {
            RepoLocation::CoLocated { root } | RepoLocation::External { root } => Some(root),
            RepoLocation::Unversioned => None,
        }
    }

    /// Whether sync commits land outside the caller's repository.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        matches!(self.location, RepoLocation::External { .. })
    }

    /// Path of the database file inside the workspace.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        std::env::var("BEADS_DB").map_or_else(|_| self.dir.join("beads.db"), PathBuf::from)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the workspace for `cwd`.
///
/// Resolution order:
/// 1. `BEADS_DIR`, when set (relative paths resolve against `cwd`).
/// 2. In a linked git worktree: `<main repo root>/.beads`.
/// 3. Upward walk from `cwd` to the filesystem root.
///
/// A `redirect` file in the resolved directory is followed exactly once;
/// a second level of indirection is diagnosed and aborts resolution.
///
/// # Errors
/// `NotFound` when no workspace exists, `Fatal` on a redirect chain or
/// cycle.
pub fn resolve(cwd: &Path) -> Result<Workspace> {
    let candidate = find_workspace_dir(cwd)?;
    let (dir, redirected) = follow_redirect(&candidate)?;
    let dir = canonical(&dir);
    let location = classify(&dir, cwd)?;
    Ok(Workspace {
        dir,
        redirected,
        location,
    })
}

/// Process-global cache of the last resolution, keyed by (cwd, override).
/// Invalidated whenever the current directory changes, notably in tests.
static CACHE: Mutex<Option<(PathBuf, Option<String>, Workspace)>> = Mutex::new(None);

/// [`resolve`], memoized per (cwd, `BEADS_DIR`).
///
/// # Errors
/// Same as [`resolve`].
pub fn resolve_cached(cwd: &Path) -> Result<Workspace> {
    let override_var = std::env::var(ENV_BEADS_DIR).ok();
    if let Ok(guard) = CACHE.lock() {
        if let Some((cached_cwd, cached_override, ws)) = guard.as_ref() {
            if cached_cwd == cwd && *cached_override == override_var {
                return Ok(ws.clone());
            }
        }
    }
    let ws = resolve(cwd)?;
    if let Ok(mut guard) = CACHE.lock() {
        *guard = Some((cwd.to_path_buf(), override_var, ws.clone()));
    }
    Ok(ws)
}

/// Drop the resolver cache. Call after changing the working directory.
pub fn invalidate_cache() {
    if let Ok(mut guard) = CACHE.lock() {
        *guard = None;
    }
}

fn find_workspace_dir(cwd: &Path) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_BEADS_DIR) {
        let path = PathBuf::from(&dir);
        let path = if path.is_absolute() { path } else { cwd.join(path) };
        if !path.is_dir() {
            return Err(BeadsError::NotFound {
                id: format!("{ENV_BEADS_DIR}={dir} (directory does not exist)"),
            });
        }
        return Ok(path);
    }

    // Worktrees share state with the main repository: resolve against the
    // common directory's parent, not the worktree root.
    if Git::is_linked_worktree(cwd).unwrap_or(false) {
        if let Ok(common) = Git::common_dir(cwd) {
            if let Some(main_root) = common.parent() {
                let candidate = main_root.join(WORKSPACE_DIR);
                if candidate.is_dir() {
                    return Ok(candidate);
                }
            }
        }
    }

    let mut dir = Some(cwd);
    while let Some(current) = dir {
        let candidate = current.join(WORKSPACE_DIR);
        if candidate.is_dir() {
            return Ok(candidate);
        }
        dir = current.parent();
    }
    Err(BeadsError::NotFound {
        id: format!("{WORKSPACE_DIR} (walked up from {})", cwd.display()),
    })
}

fn follow_redirect(dir: &Path) -> Result<(PathBuf, bool)> {
    let redirect = dir.join(REDIRECT_FILE);
    if !redirect.is_file() {
        return Ok((dir.to_path_buf(), false));
    }
    let raw = std::fs::read_to_string(&redirect)?;
    let target = raw.trim();
    if target.is_empty() {
        return Err(BeadsError::Parse {
            origin: redirect.display().to_string(),
            line: None,
            detail: "redirect file is empty".to_owned(),
        });
    }
    let target_path = PathBuf::from(target);
    let target_path = if target_path.is_absolute() {
        target_path
    } else {
        dir.join(target_path)
    };
    if !target_path.is_dir() {
        return Err(BeadsError::NotFound {
            id: format!("redirect target {}", target_path.display()),
        });
    }
    if canonical(&target_path) == canonical(dir) {
        return Err(BeadsError::Fatal {
            detail: format!("redirect cycle: {} points at itself", dir.display()),
        });
    }
    // A single level of indirection: a redirected workspace may not
    // redirect again.
    if target_path.join(REDIRECT_FILE).is_file() {
        return Err(BeadsError::Fatal {
            detail: format!(
                "redirect chain: {} redirects to {}, which redirects again; \
                 only one level of indirection is supported",
                dir.display(),
                target_path.display()
            ),
        });
    }
    Ok((target_path, true))
}

fn classify(dir: &Path, cwd: &Path) -> Result<RepoLocation> {
    let parent = dir.parent().unwrap_or(dir);
    let Some(ws_top) = Git::toplevel(parent)? else {
        return Ok(RepoLocation::Unversioned);
    };
    let ws_top = canonical(&ws_top);
    let caller_top = Git::toplevel(cwd)?.map(|p| canonical(&p));
    if caller_top.as_deref() == Some(ws_top.as_path()) {
        Ok(RepoLocation::CoLocated { root: ws_top })
    } else {
        Ok(RepoLocation::External { root: ws_top })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
