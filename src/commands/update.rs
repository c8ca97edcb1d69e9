use std::io::Write;

use anyhow::Result;

use crate::lifecycle::Orchestrator;

pub async fn update(
    orch: &Orchestrator,
    branch: &str,
    merge: bool,
    writer: &mut impl Write,
) -> Result<()> {
    orch.update(branch, merge).await?;
    let how = if merge { "merged" } else { "rebased onto" };
    writeln!(
        writer,
        "Updated {branch}: {how} {} and refreshed.",
        orch.config().base_branch
    )?;
    Ok(())
}
