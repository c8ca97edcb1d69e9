use std::io::Write;

use anyhow::Result;

use crate::ai;
use crate::gh::{PrState, ReviewDecision};
use crate::git;
use crate::lifecycle::Orchestrator;
use crate::ports;
use crate::state::TreeRecord;

/// Summarize the tree this command runs inside: recent commits, drift from
/// the base branch, PR state, and an optional AI one-liner.
pub async fn status(
    orch: &Orchestrator,
    current: Option<&TreeRecord>,
    writer: &mut impl Write,
) -> Result<()> {
    let Some(tree) = current else {
        writeln!(writer, "Not inside a tree workspace. `arbor list` shows all trees.")?;
        return Ok(());
    };
    let Some(path) = tree.path.as_ref() else {
        writeln!(writer, "{} is shelved.", tree.display_name())?;
        return Ok(());
    };

    let base = &orch.config().base_branch;
    let log = git::recent_commits(path, 3).unwrap_or_default();
    let behind = git::commits_behind(path, base);
    let ahead = git::commits_ahead(path, base);
    let dirty = git::has_uncommitted_changes(path).unwrap_or(false);
    let pr = if orch.gh().is_available().await {
        orch.gh().pr_status(path).await
    } else {
        None
    };

    writeln!(writer, "{}  [{}]", tree.display_name(), tree.branch)?;
    writeln!(writer, "  {ahead} ahead, {behind} behind {base}")?;
    if dirty {
        writeln!(writer, "  uncommitted changes")?;
    }
    match &pr {
        Some(status) => {
            let state = match status.state {
                PrState::Open => "open",
                PrState::Merged => "merged",
                PrState::Closed => "closed",
            };
            let review = match status.review_decision {
                Some(ReviewDecision::Approved) => ", approved",
                Some(ReviewDecision::ChangesRequested) => ", changes requested",
                None => "",
            };
            writeln!(writer, "  PR {state}{review}")?;
        }
        None => writeln!(writer, "  no PR")?,
    }
    if let Some(base) = tree.port_base {
        let resolved = ports::resolve(base, &orch.config().ports.mapping);
        if resolved.is_empty() {
            writeln!(writer, "  port base {base}")?;
        } else {
            let mut services = Vec::new();
            for (name, port) in &resolved {
                let marker = if ports::is_port_open(*port).await { "up" } else { "down" };
                services.push(format!("{name}:{port} ({marker})"));
            }
            writeln!(writer, "  ports: {}", services.join(", "))?;
        }
    }
    if !log.is_empty() {
        writeln!(writer, "  recent commits:")?;
        for line in log.lines() {
            writeln!(writer, "    {line}")?;
        }
    }

    if let Some(ai_config) = &orch.config().ai {
        let context = format!(
            "Branch: {}\nLast 3 commits:\n{log}\nCommits behind base: {behind}\n\
             Uncommitted changes: {dirty}",
            tree.branch
        );
        match ai::generate_text(
            ai_config,
            orch.http(),
            "Summarize this git tree status in 1-2 sentences. Be concise.",
            &context,
        )
        .await
        {
            Ok(summary) => writeln!(writer, "\n{summary}")?,
            Err(e) => writeln!(writer, "\nAI summary unavailable: {e:#}")?,
        }
    }
    Ok(())
}
