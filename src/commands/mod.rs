use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config;
use crate::git;
use crate::lifecycle::Orchestrator;
use crate::state::TreeRecord;
use crate::store::StateStore;

pub mod cleanup;
pub mod issues;
pub mod list;
pub mod new;
pub mod prune;
pub mod ship;
pub mod status;
pub mod update;
pub mod watch;

/// Resolve the repository, its configuration, and the shared store from the
/// working directory, and detect whether this process sits inside one of
/// the repo's trees.
pub fn build_context() -> Result<(Orchestrator, Option<TreeRecord>)> {
    let cwd = std::env::current_dir()?;
    let repo_path = git::resolve_repo_root(&cwd).context("not inside a git repository")?;
    let config = config::load(&repo_path)?;
    let store = Arc::new(StateStore::open_default()?);

    let state = store.load()?;
    let current = state
        .trees_for_repo(&repo_path)
        .into_iter()
        .find(|t| t.path.as_ref().is_some_and(|p| cwd.starts_with(p)))
        .cloned();

    let orchestrator = Orchestrator::new(config, repo_path, store)
        .with_current_branch(current.as_ref().map(|t| t.branch.clone()));
    Ok((orchestrator, current))
}

/// A branch argument, defaulting to the tree the command runs inside.
pub fn resolve_branch(arg: Option<String>, current: Option<&TreeRecord>) -> Result<String> {
    arg.or_else(|| current.map(|t| t.branch.clone()))
        .context("no branch given and not inside a tree workspace")
}

pub fn confirm(
    prompt: &str,
    input: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<bool> {
    write!(writer, "{prompt} [y/N] ")?;
    writer.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(branch: &str) -> TreeRecord {
        TreeRecord {
            branch: branch.to_string(),
            repo_path: PathBuf::from("/repo"),
            path: None,
            ticket_id: None,
            title: None,
            created_at: Utc::now(),
            pr_url: None,
            merge_notified: false,
            port_base: None,
        }
    }

    #[test]
    fn resolve_branch_prefers_explicit_argument() {
        let current = record("current");
        let branch = resolve_branch(Some("explicit".into()), Some(&current)).unwrap();
        assert_eq!(branch, "explicit");
    }

    #[test]
    fn resolve_branch_falls_back_to_current_tree() {
        let current = record("current");
        assert_eq!(resolve_branch(None, Some(&current)).unwrap(), "current");
        assert!(resolve_branch(None, None).is_err());
    }

    #[test]
    fn confirm_accepts_yes_variants() {
        for (input, expected) in [("y\n", true), ("yes\n", true), ("n\n", false), ("\n", false)] {
            let mut output = Vec::new();
            let result = confirm("Proceed?", &mut input.as_bytes(), &mut output).unwrap();
            assert_eq!(result, expected, "input {input:?}");
            assert!(String::from_utf8(output).unwrap().contains("[y/N]"));
        }
    }
}
