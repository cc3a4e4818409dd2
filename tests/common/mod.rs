//! Shared harness for end-to-end tests: real git repos, a bare remote,
//! and `bd` invocations against built binaries.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// One clone of the shared remote, with its own working tree and store.
pub struct TestClone {
    pub dir: TempDir,
}

impl TestClone {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in this clone, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .arg("-C")
            .arg(self.root())
            .args(args)
            .output()
            .expect("failed to spawn git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_owned()
    }

    /// Run `bd` in this clone, returning the raw output.
    pub fn bd(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_bd"))
            .current_dir(self.root())
            .args(args)
            .output()
            .expect("failed to spawn bd")
    }

    /// Run `bd` with extra environment variables.
    pub fn bd_with_env(&self, args: &[&str], envs: &[(&str, &str)]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bd"));
        cmd.current_dir(self.root()).args(args);
        for (k, v) in envs {
            cmd.env(k, v);
        }
        cmd.output().expect("failed to spawn bd")
    }

    /// Run `bd` expecting success; returns trimmed stdout.
    pub fn bd_ok(&self, args: &[&str]) -> String {
        let out = self.bd(args);
        assert!(
            out.status.success(),
            "bd {args:?} failed\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_owned()
    }

    /// Path of this clone's journal.
    pub fn journal(&self) -> PathBuf {
        self.root().join(".beads/issues.jsonl")
    }

    pub fn journal_bytes(&self) -> Vec<u8> {
        std::fs::read(self.journal()).expect("journal should exist")
    }

    fn configure_identity(&self, name: &str) {
        self.git(&["config", "user.name", name]);
        self.git(&["config", "user.email", &format!("{name}@test.invalid")]);
        self.git(&["config", "commit.gpgsign", "false"]);
    }
}

/// A standalone (non-cloned) repository with an identity configured.
pub fn plain_repo(name: &str) -> TestClone {
    let dir = TempDir::new().expect("tempdir");
    let out = Command::new("git")
        .args(["init", "-b", "main"])
        .arg(dir.path())
        .output()
        .expect("failed to spawn git");
    assert!(out.status.success());
    let clone = TestClone { dir };
    clone.configure_identity(name);
    clone
}

/// A bare repository acting as the shared origin.
pub fn bare_remote() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let out = Command::new("git")
        .args(["init", "--bare", "-b", "main"])
        .arg(dir.path())
        .output()
        .expect("failed to spawn git");
    assert!(out.status.success());
    dir
}

/// Clone the remote into a fresh directory.
pub fn clone_from(remote: &Path, name: &str) -> TestClone {
    let dir = TempDir::new().expect("tempdir");
    let out = Command::new("git")
        .args(["clone", "-q"])
        .arg(remote)
        .arg(dir.path())
        .output()
        .expect("failed to spawn git");
    assert!(
        out.status.success(),
        "clone failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let clone = TestClone { dir };
    clone.configure_identity(name);
    clone
}

/// A remote plus two clones: A initialized the workspace (prefix `px`)
/// and pushed; B cloned afterwards.
pub fn seeded_pair() -> (TempDir, TestClone, TestClone) {
    let remote = bare_remote();
    let a = clone_from(remote.path(), "alice");
    // Cloning an empty remote leaves HEAD unborn; make main explicit.
    a.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
    a.bd_ok(&["init", "--prefix", "px"]);
    a.git(&["add", "-A"]);
    a.git(&["commit", "-m", "chore: init beads workspace"]);
    a.git(&["push", "-u", "origin", "main"]);

    let b = clone_from(remote.path(), "bob");
    (remote, a, b)
}
