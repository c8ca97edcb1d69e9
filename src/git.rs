//! Git CLI contract: worktrees, branches, pushes, and repo introspection.
//!
//! Everything shells out to `git -C <dir> …`. Only the result shapes matter
//! to the callers — which commands are considered fatal vs best-effort is
//! decided per call site in the lifecycle and reconciliation layers.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("branch '{0}' already exists")]
    BranchExists(String),
    #[error("refusing to remove path outside the trees directory: {}", .0.display())]
    UnsafeRemoval(PathBuf),
    #[error("rebase failed: {0}")]
    Rebase(String),
    #[error("git command failed: {0}")]
    Command(String),
}

fn path_str(path: &Path) -> Result<&str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::Command("path is not valid UTF-8".into()))
}

/// Run a git command in the given directory and return stdout.
fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map_err(|e| GitError::Command(format!("failed to run git: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GitError::Command(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

/// Run a git command and return whether it exited successfully.
fn git_ok(dir: &Path, args: &[&str]) -> Result<bool, GitError> {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| GitError::Command(format!("failed to run git: {e}")))?;
    Ok(status.success())
}

// ── Repo introspection ──────────────────────────────────────────────────

/// Whether the repository has an `origin` remote. Remote-touching
/// operations are skipped for purely local repositories.
pub fn has_remote(dir: &Path) -> bool {
    git(dir, &["remote"])
        .map(|out| out.lines().any(|r| r.trim() == "origin"))
        .unwrap_or(false)
}

/// Resolve the canonical (non-worktree) repository root from any path
/// inside the repo or one of its worktrees.
pub fn resolve_repo_root(dir: &Path) -> Result<PathBuf, GitError> {
    let raw = git(dir, &["rev-parse", "--git-common-dir"])?;
    let trimmed = raw.trim();
    let common = if Path::new(trimmed).is_absolute() {
        PathBuf::from(trimmed)
    } else {
        dir.join(trimmed)
    };
    let root = common
        .parent()
        .ok_or_else(|| GitError::Command("git common dir has no parent".into()))?;
    // Normalize "." components left by relative --git-common-dir output.
    Ok(root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf()))
}

pub fn current_branch(dir: &Path) -> Result<String, GitError> {
    Ok(git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool, GitError> {
    git_ok(
        repo,
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
}

pub fn has_uncommitted_changes(worktree: &Path) -> Result<bool, GitError> {
    Ok(!git(worktree, &["status", "--porcelain"])?.trim().is_empty())
}

/// Commits on `base_ref` not yet in the worktree. Errors count as zero —
/// a missing base ref must not break status displays.
pub fn commits_behind(worktree: &Path, base_ref: &str) -> u32 {
    git(worktree, &["rev-list", "--count", &format!("HEAD..{base_ref}")])
        .ok()
        .and_then(|out| out.trim().parse().ok())
        .unwrap_or(0)
}

pub fn commits_ahead(worktree: &Path, base_ref: &str) -> u32 {
    git(worktree, &["rev-list", "--count", &format!("{base_ref}..HEAD")])
        .ok()
        .and_then(|out| out.trim().parse().ok())
        .unwrap_or(0)
}

/// Diff of the branch against its merge base with `base_ref`.
pub fn diff_from_base(worktree: &Path, base_ref: &str) -> Result<String, GitError> {
    git(worktree, &["diff", &format!("{base_ref}...HEAD")])
}

pub fn recent_commits(worktree: &Path, count: u32) -> Result<String, GitError> {
    Ok(git(worktree, &["log", "--oneline", &format!("-{count}")])?
        .trim()
        .to_string())
}

/// Relative age of the last commit, e.g. "3 days ago".
pub fn last_commit_age(worktree: &Path) -> Option<String> {
    let out = git(worktree, &["log", "-1", "--format=%cr"]).ok()?;
    let age = out.trim();
    (!age.is_empty()).then(|| age.to_string())
}

// ── Worktree lifecycle ──────────────────────────────────────────────────

pub fn fetch_origin(repo: &Path) -> Result<(), GitError> {
    if !has_remote(repo) {
        debug!("no origin remote in {}, skipping fetch", repo.display());
        return Ok(());
    }
    git(repo, &["fetch", "origin"])?;
    Ok(())
}

/// Create a worktree on a *new* branch cut from `base_ref`.
pub fn create_worktree(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    base_ref: &str,
) -> Result<(), GitError> {
    if branch_exists(repo, branch)? {
        return Err(GitError::BranchExists(branch.to_string()));
    }
    fetch_origin(repo)?;
    git(repo, &["worktree", "prune"])?;
    let wt = path_str(worktree_path)?;
    git(repo, &["worktree", "add", wt, "-b", branch, base_ref])?;
    Ok(())
}

/// Create a worktree for an *existing* branch. If the branch is checked out
/// in the main repo, the main repo's HEAD is detached first so the worktree
/// can take it over.
pub fn checkout_worktree(repo: &Path, worktree_path: &Path, branch: &str) -> Result<(), GitError> {
    let head = git(repo, &["symbolic-ref", "--short", "HEAD"])
        .map(|out| out.trim().to_string())
        .unwrap_or_default();
    if head == branch {
        git(repo, &["checkout", "--detach"])?;
    }
    git(repo, &["worktree", "prune"])?;
    let wt = path_str(worktree_path)?;
    git(repo, &["worktree", "add", wt, branch])?;
    Ok(())
}

/// Remove a worktree. Falls back to deleting the directory and pruning when
/// git refuses (folder already gone, or never registered).
///
/// The path must sit strictly inside `trees_root` — a mangled record must
/// never aim this at a user's real checkout.
pub fn remove_worktree(repo: &Path, worktree_path: &Path, trees_root: &Path) -> Result<(), GitError> {
    if !worktree_path.starts_with(trees_root) || worktree_path == trees_root {
        return Err(GitError::UnsafeRemoval(worktree_path.to_path_buf()));
    }
    let wt = path_str(worktree_path)?;
    if let Err(e) = git(repo, &["worktree", "remove", wt, "--force"]) {
        debug!("worktree remove failed ({e}), falling back to manual delete");
        match std::fs::remove_dir_all(worktree_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GitError::Command(format!("failed to delete worktree: {e}"))),
        }
        let _ = git(repo, &["worktree", "prune"]);
    }
    Ok(())
}

/// Delete a branch locally, and on origin unless `skip_remote`. The remote
/// deletion is best-effort — the branch may already be gone server-side.
pub fn delete_branch(repo: &Path, branch: &str, skip_remote: bool) -> Result<(), GitError> {
    git(repo, &["branch", "-D", branch])?;
    if !skip_remote && has_remote(repo) {
        if let Err(e) = git(repo, &["push", "origin", "--delete", branch]) {
            debug!("remote delete of {branch} failed: {e}");
        }
    }
    Ok(())
}

pub fn push_branch(worktree: &Path, branch: &str) -> Result<(), GitError> {
    git(worktree, &["push", "-u", "origin", branch])?;
    Ok(())
}

pub fn pull_rebase(worktree: &Path, base_ref: &str) -> Result<(), GitError> {
    fetch_origin(worktree)?;
    git(worktree, &["rebase", base_ref]).map_err(|e| GitError::Rebase(e.to_string()))?;
    Ok(())
}

pub fn pull_merge(worktree: &Path, base_ref: &str) -> Result<(), GitError> {
    fetch_origin(worktree)?;
    git(worktree, &["merge", base_ref])?;
    Ok(())
}

// ── Branch listing ──────────────────────────────────────────────────────

/// Branches suitable for a new tree: local plus remote-only, minus the base
/// branch and branches already held by a non-main worktree. The main repo's
/// checked-out branch stays listed — checkout detaches it when needed.
pub fn list_branches(repo: &Path, base_branch: &str) -> Result<Vec<String>, GitError> {
    fetch_origin(repo)?;

    let wt_out = git(repo, &["worktree", "list", "--porcelain"])?;
    let mut wt_branches = std::collections::HashSet::new();
    let mut wt_index = 0usize;
    for line in wt_out.lines() {
        if line.starts_with("worktree ") {
            wt_index += 1;
        } else if wt_index > 1
            && let Some(b) = line.strip_prefix("branch refs/heads/")
        {
            wt_branches.insert(b.to_string());
        }
    }

    let local_out = git(repo, &["branch", "--format=%(refname:short)"])?;
    let mut branches: std::collections::BTreeSet<String> = local_out
        .lines()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect();

    if has_remote(repo) {
        let remote_out = git(
            repo,
            &["for-each-ref", "--format=%(refname:short)", "refs/remotes/origin/"],
        )?;
        for line in remote_out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line == "origin/HEAD" {
                continue;
            }
            if let Some(name) = line.strip_prefix("origin/") {
                branches.insert(name.to_string());
            }
        }
    }

    let base = base_branch.strip_prefix("origin/").unwrap_or(base_branch);
    Ok(branches
        .into_iter()
        .filter(|b| b != base && !wt_branches.contains(b))
        .collect())
}
