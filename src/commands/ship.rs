use std::io::Write;

use anyhow::Result;

use crate::lifecycle::{Orchestrator, ShipOptions};

pub async fn ship(
    orch: &Orchestrator,
    branch: &str,
    opts: ShipOptions,
    writer: &mut impl Write,
) -> Result<()> {
    let outcome = orch.ship(branch, opts).await?;
    match &outcome.pr_url {
        Some(url) => writeln!(writer, "Shipped {branch}. PR: {url}")?,
        None => writeln!(writer, "Shipped {branch} (pushed, no PR created).")?,
    }
    for warning in &outcome.warnings {
        writeln!(writer, "warning: {warning}")?;
    }
    Ok(())
}
