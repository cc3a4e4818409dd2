//! Git subprocess wrapper.
//!
//! All git interaction shells out to the `git` binary with `-C <root>` so
//! the same code serves co-located and external workspaces. Output is
//! captured; failures carry the command and git's stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{BeadsError, Result};

/// Handle to one git repository, addressed by its worktree root.
#[derive(Clone, Debug)]
pub struct Git {
    root: PathBuf,
}

impl Git {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The repository root this handle addresses.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git with `args`, returning trimmed stdout.
    ///
    /// # Errors
    /// [`BeadsError::Git`] with stderr on a non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(BeadsError::Git {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Run git and return the raw output regardless of exit status. The
    /// caller inspects the status; used where a non-zero exit is one of
    /// the expected outcomes (pull conflicts, probe commands).
    ///
    /// # Errors
    /// Only if git itself cannot be spawned.
    pub fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BeadsError::Transient {
                detail: format!("failed to spawn git {}: {e}", args.join(" ")),
            })
    }

    /// Run git under a cancellation token. The child is placed in its own
    /// process group; on cancel the whole group is signalled and
    /// [`BeadsError::Cancelled`] is returned.
    ///
    /// # Errors
    /// `Cancelled` on cancellation, `Git` on a non-zero exit.
    pub fn run_cancellable(&self, args: &[&str], cancel: &CancelToken) -> Result<String> {
        cancel.check()?;

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|e| BeadsError::Transient {
            detail: format!("failed to spawn git {}: {e}", args.join(" ")),
        })?;

        loop {
            if cancel.is_cancelled() {
                kill_group(&mut child);
                let _ = child.wait();
                return Err(BeadsError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(e) => return Err(BeadsError::Io(e)),
            }
        }

        let output = child.wait_with_output().map_err(BeadsError::Io)?;
        if !output.status.success() {
            return Err(BeadsError::Git {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    /// `git rev-parse --show-toplevel` for `dir`, or `None` outside a repo.
    ///
    /// # Errors
    /// Only if git cannot be spawned.
    pub fn toplevel(dir: &Path) -> Result<Option<PathBuf>> {
        let output = Self::new(dir).output(&["rev-parse", "--show-toplevel"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(Some(PathBuf::from(path)))
    }

    /// The git common directory (shared across worktrees), absolute.
    ///
    /// # Errors
    /// `Git` when `dir` is not inside a repository.
    pub fn common_dir(dir: &Path) -> Result<PathBuf> {
        let out = Self::new(dir).run(&["rev-parse", "--git-common-dir"])?;
        let p = PathBuf::from(out);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(dir.join(p))
        }
    }

    /// The `.git` directory for `dir` (per-worktree), absolute.
    ///
    /// # Errors
    /// `Git` when `dir` is not inside a repository.
    pub fn git_dir(dir: &Path) -> Result<PathBuf> {
        let out = Self::new(dir).run(&["rev-parse", "--git-dir"])?;
        let p = PathBuf::from(out);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(dir.join(p))
        }
    }

    /// Whether `dir` sits inside a linked worktree (not the main one).
    ///
    /// # Errors
    /// Only if git cannot be spawned.
    pub fn is_linked_worktree(dir: &Path) -> Result<bool> {
        let Some(_top) = Self::toplevel(dir)? else {
            return Ok(false);
        };
        let git_dir = Self::git_dir(dir)?;
        let common = Self::common_dir(dir)?;
        Ok(canonical(&git_dir) != canonical(&common))
    }

    /// Current branch name, or `None` on a detached HEAD.
    ///
    /// # Errors
    /// Only if git cannot be spawned.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let output = self.output(&["symbolic-ref", "--short", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        ))
    }

    /// `git status --porcelain`, one entry per changed path.
    ///
    /// # Errors
    /// `Git` on failure.
    pub fn status_porcelain(&self) -> Result<Vec<String>> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// Whether the repository has unresolved merge or rebase state.
    ///
    /// # Errors
    /// `Git` when the repository cannot be inspected.
    pub fn in_merge_or_rebase(&self) -> Result<bool> {
        let git_dir = Self::git_dir(&self.root)?;
        Ok(git_dir.join("MERGE_HEAD").exists()
            || git_dir.join("rebase-merge").exists()
            || git_dir.join("rebase-apply").exists())
    }

    /// Paths with unresolved conflicts (`git diff --name-only
    /// --diff-filter=U`).
    ///
    /// # Errors
    /// `Git` on failure.
    pub fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Read a file's contents at a ref or index stage (`git show
    /// <spec>:<path>` or `git show :<stage>:<path>`), or `None` when absent.
    ///
    /// # Errors
    /// Only if git cannot be spawned.
    pub fn show(&self, spec: &str) -> Result<Option<Vec<u8>>> {
        let output = self.output(&["show", spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Stage the given paths.
    ///
    /// # Errors
    /// `Git` on failure.
    pub fn add(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run(&args)?;
        Ok(())
    }

    /// Commit with `message`. Returns `false` when there was nothing to
    /// commit, which is not an error.
    ///
    /// # Errors
    /// `Git` on any other failure.
    pub fn commit(&self, message: &str) -> Result<bool> {
        let output = self.output(&["commit", "-m", message])?;
        if output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
            return Ok(false);
        }
        Err(BeadsError::Git {
            command: "git commit".to_owned(),
            stderr: stderr.trim().to_owned(),
        })
    }

    /// Set a repository-local config key.
    ///
    /// # Errors
    /// `Git` on failure.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", key, value])?;
        Ok(())
    }
}

/// Canonicalize, falling back to the input when the path does not resolve.
/// Symlinks are resolved before any path comparison (`/var` vs
/// `/private/var` on macOS).
#[must_use]
pub fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init", "-b", "main"]).unwrap();
        git.run(&["config", "user.name", "Test"]).unwrap();
        git.run(&["config", "user.email", "test@test.invalid"])
            .unwrap();
        git.run(&["config", "commit.gpgsign", "false"]).unwrap();
        dir
    }

    #[test]
    fn run_captures_stderr_on_failure() {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path());
        let err = git.run(&["rev-parse", "--show-toplevel"]).unwrap_err();
        assert!(matches!(err, BeadsError::Git { .. }));
    }

    #[test]
    fn toplevel_is_none_outside_a_repo() {
        let dir = TempDir::new().unwrap();
        assert!(Git::toplevel(dir.path()).unwrap().is_none());
    }

    #[test]
    fn toplevel_finds_the_root_from_a_subdir() {
        let dir = init_repo();
        let sub = dir.path().join("a/b");
        std::fs::create_dir_all(&sub).unwrap();
        let top = Git::toplevel(&sub).unwrap().unwrap();
        assert_eq!(canonical(&top), canonical(dir.path()));
    }

    #[test]
    fn commit_reports_nothing_to_commit_as_false() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        std::fs::write(dir.path().join("f.txt"), "x\n").unwrap();
        git.add(&["f.txt"]).unwrap();
        assert!(git.commit("add f").unwrap());
        assert!(!git.commit("empty").unwrap());
    }

    #[test]
    fn current_branch_reads_symbolic_ref() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        std::fs::write(dir.path().join("f.txt"), "x\n").unwrap();
        git.add(&["f.txt"]).unwrap();
        git.commit("init").unwrap();
        assert_eq!(git.current_branch().unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn linked_worktree_is_detected() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        std::fs::write(dir.path().join("f.txt"), "x\n").unwrap();
        git.add(&["f.txt"]).unwrap();
        git.commit("init").unwrap();

        let wt = dir.path().join("wt");
        git.run(&["worktree", "add", wt.to_str().unwrap(), "-b", "side"])
            .unwrap();

        assert!(!Git::is_linked_worktree(dir.path()).unwrap());
        assert!(Git::is_linked_worktree(&wt).unwrap());
    }

    #[test]
    fn cancelled_token_aborts_before_spawn() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        let token = CancelToken::new();
        token.cancel();
        let err = git.run_cancellable(&["status"], &token).unwrap_err();
        assert!(matches!(err, BeadsError::Cancelled));
    }
}

#[cfg(unix)]
fn kill_group(child: &mut std::process::Child) {
    // The child leads its own process group; signal the whole group so
    // helpers spawned by git die too.
    let pgid = child.id();
    let _ = Command::new("kill")
        .args(["-TERM", &format!("-{pgid}")])
        .status();
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut std::process::Child) {
    let _ = child.kill();
}
