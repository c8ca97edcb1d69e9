//! Teardown-family commands: cleanup, cancel, shelve, resume.

use std::io::{BufRead, Write};

use anyhow::Result;

use crate::lifecycle::{Orchestrator, TeardownOutcome};
use crate::state::TreeRecord;

use super::confirm;

pub async fn cleanup(
    orch: &Orchestrator,
    branch: &str,
    yes: bool,
    input: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<()> {
    let prompt = format!(
        "Clean up {branch}? This merges its PR, then removes the worktree and branch."
    );
    if !yes && !confirm(&prompt, input, writer)? {
        return Ok(());
    }
    let outcome = orch.cleanup(branch).await?;
    report(outcome, branch, writer)
}

pub async fn cancel(
    orch: &Orchestrator,
    branch: &str,
    yes: bool,
    input: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<()> {
    let prompt =
        format!("Cancel {branch}? This removes the worktree and branch without merging.");
    if !yes && !confirm(&prompt, input, writer)? {
        return Ok(());
    }
    let outcome = orch.cancel(branch).await?;
    report(outcome, branch, writer)
}

pub async fn shelve(
    orch: &Orchestrator,
    branch: &str,
    yes: bool,
    input: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<()> {
    let prompt = format!("Shelve {branch}? This removes the worktree but keeps the branch.");
    if !yes && !confirm(&prompt, input, writer)? {
        return Ok(());
    }
    orch.shelve(branch).await?;
    writeln!(writer, "Shelved {branch}. Bring it back with `arbor resume {branch}`.")?;
    Ok(())
}

pub async fn resume(orch: &Orchestrator, branch: &str, writer: &mut impl Write) -> Result<()> {
    let record = orch.resume(branch).await?;
    print_resumed(&record, writer)
}

fn print_resumed(record: &TreeRecord, writer: &mut impl Write) -> Result<()> {
    let path = record
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    writeln!(writer, "Resumed {} at {path}", record.display_name())?;
    Ok(())
}

fn report(outcome: TeardownOutcome, branch: &str, writer: &mut impl Write) -> Result<()> {
    match outcome {
        TeardownOutcome::Done => writeln!(writer, "Removed {branch}.")?,
        TeardownOutcome::SelfWorkspace => writeln!(
            writer,
            "Removed {branch} from state. Close this workspace — another arbor \
             process finishes the git cleanup."
        )?,
        TeardownOutcome::AlreadyInProgress => {
            writeln!(writer, "A teardown of {branch} is already running.")?;
        }
    }
    Ok(())
}
