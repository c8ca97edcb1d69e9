use std::io::Write;

use anyhow::{Context, Result};
use tracing::warn;

use crate::git;
use crate::hydrate;
use crate::ident;
use crate::lifecycle::{CreateRequest, Orchestrator};

pub struct NewArgs {
    pub branch: Option<String>,
    pub ticket: Option<String>,
    pub title: Option<String>,
    pub existing: bool,
}

/// Create a new tree from a branch, a ticket, or both.
pub async fn new(orch: &Orchestrator, args: NewArgs, writer: &mut impl Write) -> Result<()> {
    // `--existing` without a branch: show what could be checked out.
    if args.existing && args.branch.is_none() {
        return list_available_branches(orch, writer);
    }

    let mut ticket = args.ticket;
    let mut title = args.title;

    // With only a branch name, the ticket may be recoverable from it.
    if ticket.is_none()
        && let Some(branch) = &args.branch
    {
        ticket = ident::parse_ticket_id(branch, &orch.config().branch_format);
    }

    // Fill the title from the tracker when the ticket is known.
    if title.is_none()
        && let (Some(ticket_id), Some(linear)) = (&ticket, orch.linear())
    {
        match linear.get_issue(ticket_id).await {
            Some(issue) => title = Some(issue.title),
            None => warn!("ticket {ticket_id} not found in tracker"),
        }
    }

    let branch = match args.branch {
        Some(branch) => branch,
        None => {
            let ticket_id = ticket
                .as_deref()
                .context("either --branch or --ticket is required")?;
            ident::render_branch(
                &orch.config().branch_format,
                ticket_id,
                title.as_deref().unwrap_or(ticket_id),
            )
        }
    };

    let record = orch
        .create_tree(CreateRequest {
            branch,
            ticket_id: ticket,
            title,
            existing_branch: args.existing,
        })
        .await?;

    // Move the ticket to its on-create status; a tracker hiccup must not
    // fail the already-created tree.
    if let (Some(linear), Some(ticket_id), Some(status)) = (
        orch.linear(),
        &record.ticket_id,
        orch.config().linear.statuses.on_new.as_deref(),
    ) && let Err(e) = linear.update_issue_state(ticket_id, status).await
    {
        writeln!(writer, "note: ticket update failed: {e:#}")?;
    }

    let path = record.path.as_ref().map(|p| p.display().to_string());
    writeln!(
        writer,
        "Created {} at {}",
        record.display_name(),
        path.unwrap_or_default()
    )?;
    writeln!(
        writer,
        "Workspace: {}",
        hydrate::workspace_file_path(orch.config(), &record.branch).display()
    )?;
    Ok(())
}

/// Branches that could back a new tree: not the base branch, not checked
/// out in a worktree, and not already tracked as a tree.
fn list_available_branches(orch: &Orchestrator, writer: &mut impl Write) -> Result<()> {
    let branches = git::list_branches(orch.repo_path(), &orch.config().base_branch)?;
    let state = orch.store().load()?;
    let used: std::collections::HashSet<&str> = state
        .trees_for_repo(orch.repo_path())
        .into_iter()
        .map(|t| t.branch.as_str())
        .collect();
    let available: Vec<&String> = branches.iter().filter(|b| !used.contains(b.as_str())).collect();

    if available.is_empty() {
        writeln!(writer, "No available branches — every branch has a tree already.")?;
        return Ok(());
    }
    writeln!(writer, "Available branches (use --existing --branch <name>):")?;
    for branch in available {
        writeln!(writer, "  {branch}")?;
    }
    Ok(())
}
