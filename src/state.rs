//! Tree records and the persisted forest state.
//!
//! State lives in a single JSON file (by default `~/.arbor/state.json`)
//! shared by every arbor process on the machine. Records are keyed by
//! `"<repo_path>:<branch>"` so one repository can hold many trees and many
//! repositories can share the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version. Bump when the record shape changes and
/// teach [`ForestState::migrate`] how to upgrade older files.
pub const STATE_VERSION: u32 = 2;

/// One worktree bound to a branch, and optionally a ticket and a port block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRecord {
    pub branch: String,
    /// Canonical (non-worktree) repository root.
    pub repo_path: PathBuf,
    /// Live worktree path. `None` means the tree is shelved: the branch and
    /// record persist, the checkout does not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Set once at creation, never mutated afterwards.
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// One-shot guard so a merged PR is announced to the user only once.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merge_notified: bool,
    /// Base of this tree's port block; service ports are `base + offset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_base: Option<u16>,
}

impl TreeRecord {
    /// Identity key within [`ForestState::trees`].
    pub fn key(&self) -> String {
        tree_key(&self.repo_path, &self.branch)
    }

    pub fn is_shelved(&self) -> bool {
        self.path.is_none()
    }

    /// Display name: "TICKET-ID  title" when a ticket is linked, otherwise
    /// the title (when it adds information), otherwise the branch.
    pub fn display_name(&self) -> String {
        match (&self.ticket_id, &self.title) {
            (Some(ticket), Some(title)) => format!("{ticket}  {title}"),
            (None, Some(title)) if *title != self.branch => title.clone(),
            _ => self.branch.clone(),
        }
    }
}

pub fn tree_key(repo_path: &Path, branch: &str) -> String {
    format!("{}:{branch}", repo_path.display())
}

/// The root persisted object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestState {
    pub version: u32,
    pub trees: BTreeMap<String, TreeRecord>,
}

impl ForestState {
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            trees: BTreeMap::new(),
        }
    }

    pub fn trees_for_repo(&self, repo_path: &Path) -> Vec<&TreeRecord> {
        self.trees
            .values()
            .filter(|t| t.repo_path == repo_path)
            .collect()
    }

    pub fn get_tree(&self, repo_path: &Path, branch: &str) -> Option<&TreeRecord> {
        self.trees.get(&tree_key(repo_path, branch))
    }

    /// Upgrade an older schema in place.
    ///
    /// Version 1 required `ticket_id` and `title`; trees created without a
    /// ticket stored the branch name in both as a synthetic default. Those
    /// synthetic values become `None`; everything else (real tickets, PR
    /// URLs, timestamps, paths) is preserved verbatim.
    pub fn migrate(&mut self) {
        if self.version < 2 {
            for tree in self.trees.values_mut() {
                if tree.ticket_id.as_deref() == Some(tree.branch.as_str()) {
                    tree.ticket_id = None;
                }
                if tree.title.as_deref() == Some(tree.branch.as_str()) {
                    tree.title = None;
                }
            }
        }
        self.version = STATE_VERSION;
    }
}
