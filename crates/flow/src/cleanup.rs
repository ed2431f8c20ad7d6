//! Background flow sweeper
//!
//! Spawns a periodic task that drops expired and long-finished flows and
//! sweeps the state registry. Each pass walks the sharded flow map with
//! `try_lock`, so it never waits behind an in-progress callback.

use std::time::Duration;

use tracing::{debug, info};

use crate::orchestrator::Orchestrator;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn a task that runs `Orchestrator::cleanup` every `interval`.
///
/// Abort the returned handle to stop it.
pub fn spawn_cleanup_task(
    orchestrator: Orchestrator,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; nothing can be stale yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = orchestrator.cleanup();
            if report.flows_removed > 0 || report.states_removed > 0 {
                info!(
                    flows_removed = report.flows_removed,
                    states_removed = report.states_removed,
                    flows_remaining = orchestrator.len(),
                    "cleanup pass"
                );
            } else {
                debug!(flows_remaining = orchestrator.len(), "cleanup pass, nothing to remove");
            }
        }
    })
}
