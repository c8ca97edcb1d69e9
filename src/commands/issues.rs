use std::io::Write;

use anyhow::{Context, Result};

use crate::lifecycle::Orchestrator;

pub struct IssueArgs {
    /// Title for a new issue; lists assigned issues when absent.
    pub create: Option<String>,
    pub team: Option<String>,
    pub priority: Option<u8>,
}

/// List the caller's tracker issues, or create one.
pub async fn issues(orch: &Orchestrator, args: IssueArgs, writer: &mut impl Write) -> Result<()> {
    let linear = orch
        .linear()
        .context("Linear is not configured — set linear.enabled and linear.api_key")?;
    let config = orch.config();

    if let Some(title) = args.create {
        let team = args
            .team
            .or_else(|| config.linear.teams.first().cloned())
            .context("no team given and none configured under linear.teams")?;
        let ticket = linear.create_issue(&title, args.priority, &team).await?;
        writeln!(writer, "Created {ticket}: {title}")?;
        writeln!(writer, "Start it with: arbor new --ticket {ticket}")?;
        return Ok(());
    }

    let issues = linear
        .list_my_issues(&config.linear.statuses.issue_list, &config.linear.teams)
        .await;
    if issues.is_empty() {
        writeln!(writer, "No assigned issues.")?;
        return Ok(());
    }

    // Issues already bound to a tree are marked so they aren't started twice.
    let state = orch.store().load()?;
    let linked: std::collections::HashSet<String> = state
        .trees_for_repo(orch.repo_path())
        .into_iter()
        .filter_map(|t| t.ticket_id.clone())
        .collect();

    for issue in issues {
        let marker = if linked.contains(&issue.id) { "  (has tree)" } else { "" };
        writeln!(writer, "{}  {}  [{}]{marker}", issue.id, issue.title, issue.state)?;
    }
    Ok(())
}
