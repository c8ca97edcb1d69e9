use std::io::Write;

use anyhow::Result;

use crate::lifecycle::Orchestrator;
use crate::reconcile;

/// One-shot orphan sweep: drop records whose worktree folders were deleted
/// outside arbor.
pub async fn prune(orch: &Orchestrator, writer: &mut impl Write) -> Result<()> {
    let pruned =
        reconcile::prune_orphans(orch.store(), orch.config(), orch.repo_path()).await?;
    if pruned.is_empty() {
        writeln!(writer, "No orphaned trees.")?;
        return Ok(());
    }
    for branch in &pruned {
        writeln!(writer, "Pruned {branch} (worktree folder missing).")?;
    }
    Ok(())
}
