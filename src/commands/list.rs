use std::io::Write;

use anyhow::Result;

use crate::git;
use crate::lifecycle::Orchestrator;

/// List the repository's trees with their branch, location, base drift,
/// and PR state.
pub fn list(orch: &Orchestrator, writer: &mut impl Write) -> Result<()> {
    let state = orch.store().load()?;
    let mut trees = state.trees_for_repo(orch.repo_path());
    trees.sort_by(|a, b| a.branch.cmp(&b.branch));

    if trees.is_empty() {
        writeln!(writer, "No trees. Create one with `arbor new`.")?;
        return Ok(());
    }

    for tree in trees {
        let mut details = Vec::new();
        match &tree.path {
            Some(path) => {
                details.push(path.display().to_string());
                let behind = git::commits_behind(path, &orch.config().base_branch);
                if behind > 0 {
                    details.push(format!("{behind} behind"));
                }
                if let Some(age) = git::last_commit_age(path) {
                    details.push(age);
                }
            }
            None => details.push("shelved".to_string()),
        }
        if tree.pr_url.is_some() {
            details.push("PR open".to_string());
        }
        writeln!(
            writer,
            "{}  [{}]  {}",
            tree.display_name(),
            tree.branch,
            details.join(" — ")
        )?;
    }
    Ok(())
}
