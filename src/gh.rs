//! GitHub CLI contract: pull request create/merge/status via `gh`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl PrState {
    fn parse(raw: &str) -> Self {
        match raw {
            "MERGED" => Self::Merged,
            "CLOSED" => Self::Closed,
            _ => Self::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone)]
pub struct PrStatus {
    pub state: PrState,
    pub review_decision: Option<ReviewDecision>,
    pub number: Option<u64>,
}

/// Wrapper around the `gh` binary. Availability is probed once per instance
/// so a machine without `gh` degrades to the no-PR workflow instead of
/// failing every command.
pub struct GhCli {
    available: OnceCell<bool>,
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GhCli {
    pub fn new() -> Self {
        Self {
            available: OnceCell::new(),
        }
    }

    /// A client that reports `gh` as present without probing. Lets tests
    /// exercise the PR paths on machines where the probe would say no.
    #[cfg(test)]
    pub(crate) fn assume_available() -> Self {
        let available = OnceCell::new();
        let _ = available.set(true);
        Self { available }
    }

    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                Command::new("gh")
                    .arg("--version")
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status()
                    .await
                    .is_ok_and(|s| s.success())
            })
            .await
    }

    async fn gh(&self, dir: &Path, args: &[&str], timeout: Duration) -> Result<String> {
        let output = tokio::time::timeout(
            timeout,
            Command::new("gh").current_dir(dir).args(args).output(),
        )
        .await
        .with_context(|| format!("gh {} timed out", args.join(" ")))?
        .context("failed to run gh")?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
    }

    /// Create a PR for the worktree's branch. With a body the description is
    /// explicit; without one `--fill` derives it from the commits. Returns
    /// the PR URL, printed by gh on the last line of stdout.
    pub async fn create_pr(
        &self,
        worktree: &Path,
        base_branch: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<Option<String>> {
        let base = base_branch.strip_prefix("origin/").unwrap_or(base_branch);
        let mut args = vec!["pr", "create", "--base", base, "--title", title];
        match body {
            Some(body) => args.extend(["--body", body]),
            None => args.push("--fill"),
        }
        let stdout = self.gh(worktree, &args, Duration::from_secs(30)).await?;
        Ok(stdout
            .trim()
            .lines()
            .last()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from))
    }

    pub async fn merge_pr(&self, worktree: &Path) -> Result<()> {
        self.gh(
            worktree,
            &["pr", "merge", "--squash", "--delete-branch"],
            Duration::from_secs(30),
        )
        .await?;
        Ok(())
    }

    pub async fn enable_auto_merge(&self, worktree: &Path) -> Result<()> {
        self.gh(
            worktree,
            &["pr", "merge", "--auto", "--squash"],
            Duration::from_secs(30),
        )
        .await?;
        Ok(())
    }

    /// Status of the PR for the worktree's branch. `None` when there is no
    /// PR or gh fails — callers treat the two the same.
    pub async fn pr_status(&self, worktree: &Path) -> Option<PrStatus> {
        let stdout = self
            .gh(
                worktree,
                &["pr", "view", "--json", "state,reviewDecision,number"],
                Duration::from_secs(10),
            )
            .await
            .map_err(|e| debug!("pr status probe failed: {e}"))
            .ok()?;
        parse_pr_status(&stdout)
    }

    pub async fn pr_is_merged(&self, repo: &Path, branch: &str) -> bool {
        self.gh(
            repo,
            &["pr", "view", branch, "--json", "state"],
            Duration::from_secs(10),
        )
        .await
        .ok()
        .and_then(|out| parse_pr_status(&out))
        .is_some_and(|status| status.state == PrState::Merged)
    }
}

fn parse_pr_status(raw: &str) -> Option<PrStatus> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Raw {
        #[serde(default)]
        state: String,
        #[serde(default)]
        review_decision: Option<String>,
        #[serde(default)]
        number: Option<u64>,
    }

    let raw: Raw = serde_json::from_str(raw).ok()?;
    let review_decision = match raw.review_decision.as_deref() {
        Some("APPROVED") => Some(ReviewDecision::Approved),
        Some("CHANGES_REQUESTED") => Some(ReviewDecision::ChangesRequested),
        _ => None,
    };
    Some(PrStatus {
        state: PrState::parse(&raw.state),
        review_decision,
        number: raw.number,
    })
}
