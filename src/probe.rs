//! Workspace liveness probing.
//!
//! Staleness detection needs one question answered: is anything happening in
//! this dispatch's worktree? The probe reports uncommitted changes and the
//! most recent commit time; a missing worktree is "no activity", not an
//! error, since a dispatch whose workspace vanished is exactly the kind the
//! sweep should catch.

use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};

/// What a workspace looked like at probe time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub uncommitted_changes: bool,
    pub last_commit_at: Option<DateTime<Utc>>,
}

impl ActivitySnapshot {
    /// Observable progress since `since`: dirty files, or a commit newer
    /// than the dispatch itself.
    pub fn active_since(&self, since: DateTime<Utc>) -> bool {
        self.uncommitted_changes || self.last_commit_at.is_some_and(|at| at > since)
    }
}

/// Liveness probe over a dispatch worktree.
pub trait WorkspaceProbe {
    fn activity(&self, worktree: &Path) -> ActivitySnapshot;
}

/// Git-backed probe: `git status --porcelain` for dirty state and
/// `git log -1` for the newest commit timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitProbe;

impl WorkspaceProbe for GitProbe {
    fn activity(&self, worktree: &Path) -> ActivitySnapshot {
        if !worktree.is_dir() {
            return ActivitySnapshot::default();
        }
        ActivitySnapshot {
            uncommitted_changes: has_uncommitted_changes(worktree),
            last_commit_at: last_commit_at(worktree),
        }
    }
}

fn has_uncommitted_changes(worktree: &Path) -> bool {
    run_git(worktree, &["status", "--porcelain"])
        .is_some_and(|stdout| !stdout.trim().is_empty())
}

fn last_commit_at(worktree: &Path) -> Option<DateTime<Utc>> {
    let stdout = run_git(worktree, &["log", "-1", "--format=%cI"])?;
    DateTime::parse_from_rfc3339(stdout.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Run git in `worktree`, returning stdout on success and None on any
/// failure (not a repo, git missing, empty history).
fn run_git(worktree: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(worktree)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
