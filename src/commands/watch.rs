//! The long-running per-workspace watcher.
//!
//! Each open workspace runs one of these: it reconciles trees removed by
//! other processes as state-change notifications arrive, prunes orphaned
//! records once a minute, and polls for externally merged PRs every five
//! minutes. Sweeps skip a tick entirely when the previous run is still in
//! flight.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::lifecycle::Orchestrator;
use crate::reconcile::{self, Reconciler, SweepGuard};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const MERGE_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn watch(orch: &Orchestrator, writer: &mut impl Write) -> Result<()> {
    let store = orch.store();

    // Start from a pruned view so stale records never enter the diff.
    for branch in reconcile::prune_orphans(store, orch.config(), orch.repo_path()).await? {
        writeln!(writer, "pruned {branch} (worktree folder missing)")?;
    }

    let initial = store.load()?;
    let mut reconciler = Reconciler::new(
        orch.config().clone(),
        orch.repo_path().to_path_buf(),
        orch.current_branch().map(String::from),
        &initial,
    );

    let (_watcher, mut changes) = store.subscribe()?;
    let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
    prune_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut merge_tick = tokio::time::interval(MERGE_POLL_INTERVAL);
    merge_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let prune_guard = SweepGuard::new();
    let merge_guard = SweepGuard::new();

    writeln!(
        writer,
        "watching {} (ctrl-c to stop)",
        orch.repo_path().display()
    )?;

    loop {
        tokio::select! {
            changed = changes.recv() => {
                let Some(state) = changed else { break };
                for branch in reconciler.apply(&state) {
                    writeln!(writer, "cleaned up {branch} (removed by another process)")?;
                }
            }
            _ = prune_tick.tick() => {
                let Some(_token) = prune_guard.try_enter() else { continue };
                match reconcile::prune_orphans(store, orch.config(), orch.repo_path()).await {
                    Ok(pruned) => {
                        for branch in pruned {
                            writeln!(writer, "pruned {branch} (worktree folder missing)")?;
                        }
                    }
                    Err(e) => warn!("orphan sweep failed: {e:#}"),
                }
            }
            _ = merge_tick.tick() => {
                let Some(_token) = merge_guard.try_enter() else { continue };
                let merged = reconcile::poll_merged(
                    store,
                    orch.config(),
                    orch.gh(),
                    orch.repo_path(),
                    orch.current_branch(),
                )
                .await;
                match merged {
                    Ok(merged) => {
                        for tree in merged {
                            writeln!(
                                writer,
                                "{} PR was merged — run `arbor cleanup {} --yes` to finish",
                                tree.display_name(),
                                tree.branch
                            )?;
                        }
                    }
                    Err(e) => warn!("merged-PR sweep failed: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                writeln!(writer, "stopped")?;
                break;
            }
        }
    }
    Ok(())
}
