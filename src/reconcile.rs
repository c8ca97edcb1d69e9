//! Cross-process reconciliation and periodic sweeps.
//!
//! Every watching process applies the same rules, with no owner election:
//! when a tree vanishes from the state file, whichever process notices
//! first performs the git cleanup and the rest fail harmlessly — removing
//! an already-removed worktree or branch is a no-op by construction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gh::GhCli;
use crate::git;
use crate::hydrate;
use crate::state::{ForestState, TreeRecord};
use crate::store::StateStore;

/// Per-process view of the repo's trees, diffed on every state change.
pub struct Reconciler {
    config: Config,
    repo_path: PathBuf,
    /// This process's own tree — never cleaned up from here.
    current_branch: Option<String>,
    previous: Vec<TreeRecord>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        repo_path: PathBuf,
        current_branch: Option<String>,
        initial: &ForestState,
    ) -> Self {
        let previous = initial
            .trees_for_repo(&repo_path)
            .into_iter()
            .cloned()
            .collect();
        Self {
            config,
            repo_path,
            current_branch,
            previous,
        }
    }

    /// The freshest record for this process's own tree, if it still exists.
    pub fn current_tree(&self) -> Option<&TreeRecord> {
        let branch = self.current_branch.as_deref()?;
        self.previous.iter().find(|t| t.branch == branch)
    }

    /// Diff the previous tree list against `new_state` and clean up after
    /// trees removed by other processes. Returns the branches cleaned.
    pub fn apply(&mut self, new_state: &ForestState) -> Vec<String> {
        let current: Vec<TreeRecord> = new_state
            .trees_for_repo(&self.repo_path)
            .into_iter()
            .cloned()
            .collect();
        let remaining: HashSet<&str> = current.iter().map(|t| t.branch.as_str()).collect();

        let mut cleaned = Vec::new();
        for prev in &self.previous {
            if self.current_branch.as_deref() == Some(prev.branch.as_str()) {
                continue;
            }
            if !remaining.contains(prev.branch.as_str()) {
                info!("tree {} removed by another process", prev.branch);
                self.cleanup_removed(prev);
                cleaned.push(prev.branch.clone());
            }
        }

        self.previous = current;
        cleaned
    }

    /// Best-effort git cleanup for a tree some other process removed from
    /// the store. Redundant attempts across processes fail harmlessly.
    fn cleanup_removed(&self, record: &TreeRecord) {
        hydrate::remove_workspace_file(&self.config, &record.branch);
        let Some(path) = &record.path else { return };

        let trees_root = Path::new(&self.config.trees_dir);
        match git::remove_worktree(&self.repo_path, path, trees_root) {
            Ok(()) => debug!("cleaned worktree for {}", record.branch),
            Err(e) => debug!("worktree cleanup for {} skipped: {e}", record.branch),
        }
        // Full delete including the remote: a self-closing teardown in the
        // removing process leaves all git cleanup to its peers.
        match git::delete_branch(&self.repo_path, &record.branch, false) {
            Ok(()) => debug!("deleted branch {}", record.branch),
            Err(e) => debug!("branch cleanup for {} skipped: {e}", record.branch),
        }
    }
}

/// Drop records whose worktree directory vanished out-of-band (the user
/// deleted the folder), deleting their branches best-effort. Returns the
/// pruned branches. This is the only repair path for drift no filesystem
/// event ever reports.
pub async fn prune_orphans(
    store: &StateStore,
    config: &Config,
    repo_path: &Path,
) -> Result<Vec<String>> {
    let state = store.load()?;
    let mut pruned = Vec::new();
    for tree in state.trees_for_repo(repo_path) {
        let Some(path) = &tree.path else { continue };
        if path.exists() {
            continue;
        }
        warn!("pruning orphan {} ({} missing)", tree.branch, path.display());
        store.remove_tree(repo_path, &tree.branch).await?;
        hydrate::remove_workspace_file(config, &tree.branch);
        if let Err(e) = git::delete_branch(repo_path, &tree.branch, false) {
            debug!("branch delete for orphan {} skipped: {e}", tree.branch);
        }
        pruned.push(tree.branch.clone());
    }
    Ok(pruned)
}

/// Poll the PR host for externally merged trees. The first detection sets
/// `merge_notified` so the user is asked about each tree exactly once;
/// returns the newly merged records so the caller can offer cleanup.
///
/// Only the tree's own process or a main-repo process reports a given tree
/// — other tree windows stay quiet about it.
pub async fn poll_merged(
    store: &StateStore,
    config: &Config,
    gh: &GhCli,
    repo_path: &Path,
    current_branch: Option<&str>,
) -> Result<Vec<TreeRecord>> {
    if !config.github.enabled || !gh.is_available().await {
        return Ok(Vec::new());
    }
    let state = store.load()?;
    let candidates: Vec<TreeRecord> = state
        .trees_for_repo(repo_path)
        .into_iter()
        .filter(|t| t.pr_url.is_some() && t.path.is_some() && !t.merge_notified)
        .filter(|t| match current_branch {
            Some(own) => t.branch == own,
            None => true,
        })
        .cloned()
        .collect();

    let checks = join_all(candidates.iter().map(|tree| async {
        gh.pr_is_merged(repo_path, &tree.branch).await
    }))
    .await;

    let mut merged = Vec::new();
    for (tree, is_merged) in candidates.into_iter().zip(checks) {
        if !is_merged {
            continue;
        }
        info!("PR for {} was merged externally", tree.branch);
        store
            .update_tree(repo_path, &tree.branch, |t| t.merge_notified = true)
            .await?;
        merged.push(tree);
    }
    Ok(merged)
}

/// Re-entry guard for a periodic sweep: when the previous run is still in
/// flight as the timer fires, the new tick is skipped outright, not queued.
#[derive(Clone, Default)]
pub struct SweepGuard {
    running: Arc<AtomicBool>,
}

impl SweepGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to enter the sweep; returns a token released on drop, or `None`
    /// when a run is already in flight.
    pub fn try_enter(&self) -> Option<SweepToken> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(SweepToken {
            running: Arc::clone(&self.running),
        })
    }
}

pub struct SweepToken {
    running: Arc<AtomicBool>,
}

impl Drop for SweepToken {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::git::tests::init_repo;
    use crate::state::tree_key;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _trees: TempDir,
        _state: TempDir,
        repo_path: PathBuf,
        config: Config,
        store: StateStore,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TempDir::new().unwrap();
            let trees = TempDir::new().unwrap();
            let state = TempDir::new().unwrap();
            init_repo(repo.path());
            let repo_path = repo.path().canonicalize().unwrap();
            let config = Config {
                trees_dir: trees.path().display().to_string(),
                base_branch: "main".to_string(),
                ..Config::default()
            };
            let store = StateStore::new(state.path().join("state.json"));
            Self {
                _repo: repo,
                _trees: trees,
                _state: state,
                repo_path,
                config,
                store,
            }
        }

        /// Create a real worktree plus its state record.
        async fn grow_tree(&self, branch: &str) -> TreeRecord {
            let path = Path::new(&self.config.trees_dir).join(branch);
            git::create_worktree(&self.repo_path, &path, branch, "main").unwrap();
            let record = TreeRecord {
                branch: branch.to_string(),
                repo_path: self.repo_path.clone(),
                path: Some(path),
                ticket_id: None,
                title: None,
                created_at: Utc::now(),
                pr_url: None,
                merge_notified: false,
                port_base: None,
            };
            self.store.add_tree(record.clone()).await.unwrap();
            record
        }
    }

    #[tokio::test]
    async fn apply_cleans_up_trees_removed_elsewhere() {
        let fx = Fixture::new();
        let record = fx.grow_tree("removed-remotely").await;
        let initial = fx.store.load().unwrap();
        let mut reconciler =
            Reconciler::new(fx.config.clone(), fx.repo_path.clone(), None, &initial);

        // Another process removes the record.
        fx.store
            .remove_tree(&fx.repo_path, "removed-remotely")
            .await
            .unwrap();
        let new_state = fx.store.load().unwrap();

        let cleaned = reconciler.apply(&new_state);
        assert_eq!(cleaned, vec!["removed-remotely".to_string()]);
        assert!(!record.path.unwrap().exists());
        assert!(!git::branch_exists(&fx.repo_path, "removed-remotely").unwrap());
    }

    #[tokio::test]
    async fn apply_skips_this_processes_own_tree() {
        let fx = Fixture::new();
        let record = fx.grow_tree("my-own").await;
        let initial = fx.store.load().unwrap();
        let mut reconciler = Reconciler::new(
            fx.config.clone(),
            fx.repo_path.clone(),
            Some("my-own".to_string()),
            &initial,
        );

        fx.store.remove_tree(&fx.repo_path, "my-own").await.unwrap();
        let new_state = fx.store.load().unwrap();

        let cleaned = reconciler.apply(&new_state);
        assert!(cleaned.is_empty());
        assert!(record.path.unwrap().exists());
    }

    #[tokio::test]
    async fn redundant_cleanup_from_two_watchers_converges() {
        let fx = Fixture::new();
        let record = fx.grow_tree("contested").await;
        let initial = fx.store.load().unwrap();
        let mut first = Reconciler::new(fx.config.clone(), fx.repo_path.clone(), None, &initial);
        let mut second = Reconciler::new(fx.config.clone(), fx.repo_path.clone(), None, &initial);

        fx.store.remove_tree(&fx.repo_path, "contested").await.unwrap();
        let new_state = fx.store.load().unwrap();

        // Both processes notice; the loser's attempts fail harmlessly.
        first.apply(&new_state);
        second.apply(&new_state);
        assert!(!record.path.unwrap().exists());
        assert!(!git::branch_exists(&fx.repo_path, "contested").unwrap());
    }

    #[tokio::test]
    async fn apply_refreshes_cached_current_tree() {
        let fx = Fixture::new();
        fx.grow_tree("watched").await;
        let initial = fx.store.load().unwrap();
        let mut reconciler = Reconciler::new(
            fx.config.clone(),
            fx.repo_path.clone(),
            Some("watched".to_string()),
            &initial,
        );
        assert!(reconciler.current_tree().unwrap().pr_url.is_none());

        fx.store
            .update_tree(&fx.repo_path, "watched", |t| {
                t.pr_url = Some("https://github.com/acme/app/pull/9".into());
            })
            .await
            .unwrap();
        reconciler.apply(&fx.store.load().unwrap());

        assert_eq!(
            reconciler.current_tree().unwrap().pr_url.as_deref(),
            Some("https://github.com/acme/app/pull/9")
        );
    }

    #[tokio::test]
    async fn prune_orphans_drops_vanished_worktrees() {
        let fx = Fixture::new();
        let record = fx.grow_tree("vanishing").await;
        fx.grow_tree("healthy").await;

        // The user deletes the folder out-of-band.
        std::fs::remove_dir_all(record.path.unwrap()).unwrap();

        let pruned = prune_orphans(&fx.store, &fx.config, &fx.repo_path)
            .await
            .unwrap();
        assert_eq!(pruned, vec!["vanishing".to_string()]);

        let state = fx.store.load().unwrap();
        assert!(state.get_tree(&fx.repo_path, "vanishing").is_none());
        assert!(state.get_tree(&fx.repo_path, "healthy").is_some());
        assert!(!git::branch_exists(&fx.repo_path, "vanishing").unwrap());
    }

    #[tokio::test]
    async fn prune_orphans_ignores_shelved_trees() {
        let fx = Fixture::new();
        let shelved = TreeRecord {
            branch: "shelved".to_string(),
            repo_path: fx.repo_path.clone(),
            path: None,
            ticket_id: None,
            title: None,
            created_at: Utc::now(),
            pr_url: None,
            merge_notified: false,
            port_base: None,
        };
        fx.store.add_tree(shelved.clone()).await.unwrap();

        let pruned = prune_orphans(&fx.store, &fx.config, &fx.repo_path)
            .await
            .unwrap();
        assert!(pruned.is_empty());
        let state = fx.store.load().unwrap();
        assert!(state.trees.contains_key(&tree_key(&fx.repo_path, "shelved")));
    }

    #[tokio::test]
    async fn poll_merged_skips_when_github_disabled() {
        let fx = Fixture::new();
        let mut config = fx.config.clone();
        config.github.enabled = false;
        let merged = poll_merged(&fx.store, &config, &GhCli::new(), &fx.repo_path, None)
            .await
            .unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn sweep_guard_skips_overlapping_runs() {
        let guard = SweepGuard::new();
        let token = guard.try_enter().expect("first entry succeeds");
        assert!(guard.try_enter().is_none(), "overlap must be skipped");
        drop(token);
        assert!(guard.try_enter().is_some(), "free again after release");
    }
}
