//! Tree lifecycle orchestration.
//!
//! Creation reserves the state record under the file lock *before* any git
//! work — the record briefly exists without a worktree, which is what stops
//! two processes from starting the same tree. Every critical step failure
//! after the reservation triggers compensation: the record, the worktree,
//! and a newly cut branch are all rolled back best-effort, and the original
//! error is what surfaces.
//!
//! Teardown is idempotent per tree key and always removes the state record
//! before touching the filesystem: peers stop seeing the tree immediately,
//! and a process tearing down its own workspace must not delete the
//! worktree out from under itself.

use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ai;
use crate::config::Config;
use crate::gh::GhCli;
use crate::git::{self, GitError};
use crate::hydrate;
use crate::ident;
use crate::linear::LinearClient;
use crate::ports::{self, PortError};
use crate::state::TreeRecord;
use crate::store::StateStore;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("tree for branch '{0}' already exists")]
    Duplicate(String),
    #[error("max trees ({0}) reached — clean up or shelve a tree first")]
    MaxTrees(usize),
    #[error("no tree for branch '{0}'")]
    NotFound(String),
    #[error("tree '{0}' is shelved — resume it first")]
    Shelved(String),
    #[error("tree '{0}' already has a live worktree")]
    NotShelved(String),
    #[error("tree has uncommitted changes — commit or discard first")]
    Dirty,
    #[error("pull request merge failed: {0}")]
    MergeFailed(String),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Recover a typed lifecycle error that crossed an `anyhow` boundary.
fn tree_error(err: anyhow::Error) -> TreeError {
    match err.downcast::<TreeError>() {
        Ok(e) => e,
        Err(err) => match err.downcast::<GitError>() {
            Ok(e) => TreeError::Git(e),
            Err(err) => TreeError::Other(err),
        },
    }
}

pub struct CreateRequest {
    pub branch: String,
    pub ticket_id: Option<String>,
    pub title: Option<String>,
    /// Check out an existing branch instead of cutting a new one from the
    /// base ref.
    pub existing_branch: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ShipOptions {
    pub force: bool,
    pub auto_merge: bool,
    pub use_ai: bool,
}

#[derive(Debug)]
pub struct ShipOutcome {
    pub pr_url: Option<String>,
    /// Post-ship failures: reported, never rolled back.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TeardownOptions {
    pub keep_branch: bool,
    /// Skip deleting the remote branch (a squash merge already did).
    pub skip_remote_delete: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    Done,
    /// The record is gone, but this process's workspace *is* the tree: git
    /// cleanup is left to the watchers in other processes.
    SelfWorkspace,
    /// Another teardown for the same tree is already running here.
    AlreadyInProgress,
}

/// One provisioning step. Non-critical steps warn and continue; a critical
/// failure aborts creation and rolls back.
struct Step<'a> {
    label: &'static str,
    critical: bool,
    run: Pin<Box<dyn Future<Output = Result<()>> + 'a>>,
}

pub struct Orchestrator {
    config: Config,
    repo_path: PathBuf,
    store: Arc<StateStore>,
    gh: GhCli,
    linear: Option<LinearClient>,
    http: reqwest::Client,
    /// Branch of the tree this process's workspace lives in, if any.
    current_branch: Option<String>,
    teardowns_in_flight: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(config: Config, repo_path: PathBuf, store: Arc<StateStore>) -> Self {
        let http = reqwest::Client::new();
        let linear = config
            .linear
            .enabled
            .then(|| config.linear.api_key.clone())
            .flatten()
            .map(|key| LinearClient::new(key, http.clone()));
        Self {
            config,
            repo_path,
            store,
            gh: GhCli::new(),
            linear,
            http,
            current_branch: None,
            teardowns_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Mark which tree this process's workspace lives in, so teardown knows
    /// when it would be sawing off the branch it sits on.
    pub fn with_current_branch(mut self, branch: Option<String>) -> Self {
        self.current_branch = branch;
        self
    }

    #[cfg(test)]
    fn with_gh(mut self, gh: GhCli) -> Self {
        self.gh = gh;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn gh(&self) -> &GhCli {
        &self.gh
    }

    pub fn linear(&self) -> Option<&LinearClient> {
        self.linear.as_ref()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn current_branch(&self) -> Option<&str> {
        self.current_branch.as_deref()
    }

    fn trees_root(&self) -> PathBuf {
        PathBuf::from(&self.config.trees_dir)
    }

    fn tree_path_for(&self, branch: &str, ticket_id: Option<&str>) -> PathBuf {
        let dir_name = ticket_id
            .map(String::from)
            .unwrap_or_else(|| ident::sanitize_for_path(branch));
        self.trees_root().join(dir_name)
    }

    fn load_tree(&self, branch: &str) -> Result<TreeRecord, TreeError> {
        let state = self.store.load().map_err(TreeError::Other)?;
        state
            .get_tree(&self.repo_path, branch)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(branch.to_string()))
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub async fn create_tree(&self, req: CreateRequest) -> Result<TreeRecord, TreeError> {
        ident::validate_branch(&req.branch)?;
        let tree_path = self.tree_path_for(&req.branch, req.ticket_id.as_deref());

        // Reserve the record before any filesystem or git work. Validation,
        // port allocation, and the insert all happen under one lock, which
        // closes the race between two processes creating the same tree.
        let record = self
            .store
            .modify(|state| {
                if state.get_tree(&self.repo_path, &req.branch).is_some() {
                    return Err(TreeError::Duplicate(req.branch.clone()).into());
                }
                let trees = state.trees_for_repo(&self.repo_path);
                if trees.len() >= self.config.max_trees {
                    return Err(TreeError::MaxTrees(self.config.max_trees).into());
                }
                let port_base = ports::allocate(
                    &trees,
                    self.config.ports.base_range,
                    &self.config.ports.mapping,
                )
                .map_err(TreeError::from)?;

                let record = TreeRecord {
                    branch: req.branch.clone(),
                    repo_path: self.repo_path.clone(),
                    path: Some(tree_path.clone()),
                    ticket_id: req.ticket_id.clone(),
                    title: req.title.clone(),
                    created_at: Utc::now(),
                    pr_url: None,
                    merge_notified: false,
                    port_base: Some(port_base),
                };
                state.trees.insert(record.key(), record.clone());
                Ok(record)
            })
            .await
            .map_err(tree_error)?;
        info!("reserved tree {} at {}", record.branch, tree_path.display());

        match self.provision(&record, req.existing_branch).await {
            Ok(()) => Ok(record),
            Err(err) => {
                warn!("creating tree {} failed, rolling back", record.branch);
                self.rollback_create(&record, req.existing_branch).await;
                Err(err)
            }
        }
    }

    async fn provision(&self, record: &TreeRecord, existing_branch: bool) -> Result<(), TreeError> {
        let Some(tree_path) = record.path.clone() else {
            return Err(TreeError::Other(anyhow::anyhow!(
                "reserved record has no worktree path"
            )));
        };
        let port_base = record
            .port_base
            .unwrap_or(self.config.ports.base_range.0);
        let hydrated = Cell::new(false);

        let steps = vec![
            Step {
                label: "create worktree",
                critical: true,
                run: Box::pin(async {
                    if existing_branch {
                        git::checkout_worktree(&self.repo_path, &tree_path, &record.branch)?;
                    } else {
                        git::create_worktree(
                            &self.repo_path,
                            &tree_path,
                            &record.branch,
                            &self.config.base_branch,
                        )?;
                    }
                    Ok(())
                }),
            },
            Step {
                label: "copy files",
                critical: true,
                run: Box::pin(async {
                    hydrate::copy_config_files(&self.config, &self.repo_path, &tree_path)
                }),
            },
            Step {
                label: "write env file",
                critical: true,
                run: Box::pin(async {
                    hydrate::write_env_file(&self.config, &tree_path, port_base)
                }),
            },
            Step {
                label: "write workspace file",
                critical: true,
                run: Box::pin(async {
                    hydrate::write_workspace_file(
                        &self.config,
                        &tree_path,
                        &record.branch,
                        record.ticket_id.as_deref(),
                        record.title.as_deref(),
                    )
                    .map(|_| ())
                }),
            },
            Step {
                label: "hydrate dependency cache",
                critical: false,
                run: Box::pin(async {
                    hydrated.set(hydrate::hydrate_modules(&self.config, &tree_path));
                    Ok(())
                }),
            },
            Step {
                label: "run setup commands",
                critical: false,
                run: Box::pin(async {
                    hydrate::run_setup_commands(&self.config, &tree_path).await;
                    Ok(())
                }),
            },
            Step {
                label: "save dependency template",
                critical: false,
                run: Box::pin(async {
                    if !hydrated.get() {
                        hydrate::save_template(&self.config, &tree_path);
                    }
                    Ok(())
                }),
            },
            Step {
                label: "push branch",
                critical: true,
                run: Box::pin(async {
                    if git::has_remote(&tree_path) {
                        git::push_branch(&tree_path, &record.branch)?;
                    } else {
                        debug!("no origin remote, skipping push of {}", record.branch);
                    }
                    Ok(())
                }),
            },
        ];

        for step in steps {
            match step.run.await {
                Ok(()) => {}
                Err(err) if step.critical => {
                    return Err(tree_error(err.context(format!("{} failed", step.label))));
                }
                Err(err) => warn!("{} failed (continuing): {err:#}", step.label),
            }
        }
        Ok(())
    }

    /// Compensate a failed creation. Every action is best-effort — the
    /// pipeline error is what the caller must see, not a rollback failure.
    async fn rollback_create(&self, record: &TreeRecord, existing_branch: bool) {
        if let Err(e) = self
            .store
            .remove_tree(&record.repo_path, &record.branch)
            .await
        {
            warn!("rollback: failed to remove state record: {e:#}");
        }
        hydrate::remove_workspace_file(&self.config, &record.branch);
        if let Some(path) = &record.path
            && path.exists()
            && let Err(e) = git::remove_worktree(&self.repo_path, path, &self.trees_root())
        {
            warn!("rollback: failed to remove worktree: {e}");
        }
        // Only a branch this pipeline cut gets deleted; reused branches are
        // the user's.
        if !existing_branch
            && git::branch_exists(&self.repo_path, &record.branch).unwrap_or(false)
            && let Err(e) = git::delete_branch(&self.repo_path, &record.branch, false)
        {
            warn!("rollback: failed to delete branch: {e}");
        }
    }

    // ── Shelve / resume / update ────────────────────────────────────────

    pub async fn shelve(&self, branch: &str) -> Result<(), TreeError> {
        let record = self.load_tree(branch)?;
        let Some(path) = record.path.clone() else {
            return Err(TreeError::Shelved(branch.to_string()));
        };

        // Mark shelved before touching disk so other processes stop
        // treating the worktree as live.
        self.store
            .update_tree(&self.repo_path, branch, |t| t.path = None)
            .await
            .map_err(TreeError::Other)?;
        if let Err(e) = git::remove_worktree(&self.repo_path, &path, &self.trees_root()) {
            warn!("shelve: worktree removal failed: {e}");
        }
        info!("shelved {branch}");
        Ok(())
    }

    pub async fn resume(&self, branch: &str) -> Result<TreeRecord, TreeError> {
        let record = self.load_tree(branch)?;
        if record.path.is_some() {
            return Err(TreeError::NotShelved(branch.to_string()));
        }
        let tree_path = self.tree_path_for(branch, record.ticket_id.as_deref());

        git::checkout_worktree(&self.repo_path, &tree_path, branch)?;

        // Restore the path (and a port block, if the record predates port
        // tracking) under the same lock that guards allocation.
        let record = self
            .store
            .modify(|state| {
                let port_base = match state
                    .get_tree(&self.repo_path, branch)
                    .and_then(|t| t.port_base)
                {
                    Some(base) => base,
                    None => ports::allocate(
                        &state.trees_for_repo(&self.repo_path),
                        self.config.ports.base_range,
                        &self.config.ports.mapping,
                    )
                    .map_err(TreeError::from)?,
                };
                let key = crate::state::tree_key(&self.repo_path, branch);
                let Some(tree) = state.trees.get_mut(&key) else {
                    return Err(TreeError::NotFound(branch.to_string()).into());
                };
                tree.path = Some(tree_path.clone());
                tree.port_base = Some(port_base);
                Ok(tree.clone())
            })
            .await
            .map_err(tree_error)?;

        hydrate::copy_config_files(&self.config, &self.repo_path, &tree_path)
            .map_err(TreeError::Other)?;
        hydrate::write_env_file(
            &self.config,
            &tree_path,
            record.port_base.unwrap_or(self.config.ports.base_range.0),
        )
        .map_err(TreeError::Other)?;
        hydrate::write_workspace_file(
            &self.config,
            &tree_path,
            branch,
            record.ticket_id.as_deref(),
            record.title.as_deref(),
        )
        .map_err(TreeError::Other)?;
        if !hydrate::hydrate_modules(&self.config, &tree_path) {
            debug!("no dependency template for {branch}");
        }
        hydrate::run_setup_commands(&self.config, &tree_path).await;

        info!("resumed {branch}");
        Ok(record)
    }

    /// Bring the tree up to date with the base branch (rebase by default,
    /// merge on request) and refresh its provisioned files. A conflict
    /// aborts with git's message.
    pub async fn update(&self, branch: &str, merge: bool) -> Result<(), TreeError> {
        let record = self.load_tree(branch)?;
        let Some(path) = record.path.clone() else {
            return Err(TreeError::Shelved(branch.to_string()));
        };

        if merge {
            git::pull_merge(&path, &self.config.base_branch)?;
        } else {
            git::pull_rebase(&path, &self.config.base_branch)?;
        }
        hydrate::copy_config_files(&self.config, &self.repo_path, &path)
            .map_err(TreeError::Other)?;
        hydrate::write_env_file(
            &self.config,
            &path,
            record.port_base.unwrap_or(self.config.ports.base_range.0),
        )
        .map_err(TreeError::Other)?;
        hydrate::run_setup_commands(&self.config, &path).await;
        Ok(())
    }

    // ── Ship ────────────────────────────────────────────────────────────

    pub async fn ship(&self, branch: &str, opts: ShipOptions) -> Result<ShipOutcome, TreeError> {
        let record = self.load_tree(branch)?;
        let Some(path) = record.path.clone() else {
            return Err(TreeError::Shelved(branch.to_string()));
        };
        if !opts.force && git::has_uncommitted_changes(&path)? {
            return Err(TreeError::Dirty);
        }

        git::push_branch(&path, branch)?;

        let mut warnings = Vec::new();
        let mut pr_url = None;
        if self.config.github.enabled && self.gh.is_available().await {
            let title = pr_title(&record);
            let body = match (&self.config.ai, opts.use_ai) {
                (Some(ai_config), true) => {
                    match self.generate_pr_body(ai_config, &path, &title).await {
                        Ok(body) => Some(body),
                        Err(e) => {
                            warnings.push(format!("PR description generation failed: {e:#}"));
                            None
                        }
                    }
                }
                _ => None,
            };
            pr_url = self
                .gh
                .create_pr(&path, &self.config.base_branch, &title, body.as_deref())
                .await
                .context("failed to create pull request")
                .map_err(TreeError::Other)?;
        }

        // The push and PR are done; the three post-ship actions are
        // independent of each other. Run them concurrently and report
        // failures without rolling anything back.
        let enable_auto_merge = async {
            if opts.auto_merge && pr_url.is_some() {
                self.gh.enable_auto_merge(&path).await
            } else {
                Ok(())
            }
        };
        let move_ticket = async {
            match (&self.linear, &record.ticket_id, &self.config.linear.statuses.on_ship) {
                (Some(linear), Some(ticket), Some(status)) => {
                    linear.update_issue_state(ticket, status).await
                }
                _ => Ok(()),
            }
        };
        let persist_pr = async {
            match &pr_url {
                Some(url) => {
                    let url = url.clone();
                    self.store
                        .update_tree(&self.repo_path, branch, |t| t.pr_url = Some(url))
                        .await
                }
                None => Ok(()),
            }
        };
        let (auto_merge, ticket, persist) =
            tokio::join!(enable_auto_merge, move_ticket, persist_pr);
        for (label, result) in [
            ("enable auto-merge", auto_merge),
            ("update ticket", ticket),
            ("record PR URL", persist),
        ] {
            if let Err(e) = result {
                warnings.push(format!("{label} failed: {e:#}"));
            }
        }

        Ok(ShipOutcome { pr_url, warnings })
    }

    async fn generate_pr_body(
        &self,
        ai_config: &crate::config::AiConfig,
        path: &Path,
        title: &str,
    ) -> Result<String> {
        let diff = git::diff_from_base(path, &self.config.base_branch)?;
        ai::generate_pr_body(ai_config, &self.http, title, &diff).await
    }

    // ── Cleanup / cancel / teardown ─────────────────────────────────────

    /// Merge the tree's PR, move the ticket, then tear down. A merge
    /// failure aborts the whole operation — an unmerged tree is never
    /// destroyed.
    pub async fn cleanup(&self, branch: &str) -> Result<TeardownOutcome, TreeError> {
        let record = self.load_tree(branch)?;
        if record.merge_notified {
            // The PR is already known to be merged externally.
            return self.cleanup_merged(&record).await;
        }
        let mut merged = false;
        if let Some(path) = &record.path {
            if git::has_uncommitted_changes(path)? {
                return Err(TreeError::Dirty);
            }
            if self.config.github.enabled && self.gh.is_available().await {
                self.gh
                    .merge_pr(path)
                    .await
                    .map_err(|e| TreeError::MergeFailed(format!("{e:#}")))?;
                merged = true;
            }
        }
        self.move_ticket(&record, self.config.linear.statuses.on_cleanup.as_deref())
            .await;
        self.teardown(
            &record,
            TeardownOptions {
                keep_branch: false,
                // The squash merge already deleted the branch server-side.
                skip_remote_delete: merged,
            },
        )
        .await
    }

    /// Tear down without merging anything.
    pub async fn cancel(&self, branch: &str) -> Result<TeardownOutcome, TreeError> {
        let record = self.load_tree(branch)?;
        self.move_ticket(&record, self.config.linear.statuses.on_cancel.as_deref())
            .await;
        self.teardown(
            &record,
            TeardownOptions {
                keep_branch: false,
                skip_remote_delete: false,
            },
        )
        .await
    }

    /// Cleanup after an externally merged PR: no merge step, no prompt.
    pub async fn cleanup_merged(&self, record: &TreeRecord) -> Result<TeardownOutcome, TreeError> {
        self.move_ticket(record, self.config.linear.statuses.on_cleanup.as_deref())
            .await;
        self.teardown(
            record,
            TeardownOptions {
                keep_branch: false,
                skip_remote_delete: true,
            },
        )
        .await
    }

    async fn move_ticket(&self, record: &TreeRecord, status: Option<&str>) {
        let (Some(linear), Some(ticket), Some(status)) =
            (&self.linear, &record.ticket_id, status)
        else {
            return;
        };
        if let Err(e) = linear.update_issue_state(ticket, status).await {
            warn!("ticket update for {ticket} failed: {e:#}");
        }
    }

    pub async fn teardown(
        &self,
        record: &TreeRecord,
        opts: TeardownOptions,
    ) -> Result<TeardownOutcome, TreeError> {
        let key = record.key();
        if !self.begin_teardown(&key) {
            return Ok(TeardownOutcome::AlreadyInProgress);
        }
        let outcome = self.teardown_inner(record, opts).await;
        self.finish_teardown(&key);
        outcome
    }

    async fn teardown_inner(
        &self,
        record: &TreeRecord,
        opts: TeardownOptions,
    ) -> Result<TeardownOutcome, TreeError> {
        // Record first: peers stop seeing the tree immediately.
        self.store
            .remove_tree(&record.repo_path, &record.branch)
            .await
            .map_err(TreeError::Other)?;
        hydrate::remove_workspace_file(&self.config, &record.branch);

        if self.current_branch.as_deref() == Some(record.branch.as_str()) {
            // Removing the worktree would kill this process mid-teardown.
            // The watchers in other processes converge on the git cleanup.
            info!(
                "tree {} removed from its own workspace, leaving git cleanup to peers",
                record.branch
            );
            return Ok(TeardownOutcome::SelfWorkspace);
        }

        if let Some(path) = &record.path
            && let Err(e) = git::remove_worktree(&self.repo_path, path, &self.trees_root())
        {
            warn!("worktree removal for {} failed: {e}", record.branch);
        }
        if !opts.keep_branch
            && let Err(e) =
                git::delete_branch(&self.repo_path, &record.branch, opts.skip_remote_delete)
        {
            // The branch may already be gone — drift, not an error.
            debug!("branch delete for {} failed: {e}", record.branch);
        }
        info!("tore down {}", record.branch);
        Ok(TeardownOutcome::Done)
    }

    fn begin_teardown(&self, key: &str) -> bool {
        self.teardowns_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    fn finish_teardown(&self, key: &str) {
        self.teardowns_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

fn pr_title(record: &TreeRecord) -> String {
    match (&record.ticket_id, &record.title) {
        (Some(ticket), Some(title)) => format!("{ticket}: {title}"),
        (None, Some(title)) => title.clone(),
        (Some(ticket), None) => ticket.clone(),
        (None, None) => record.branch.clone(),
    }
}
