//! Reconciliation commands.
//!
//! `sweep` runs one pass and prints its report. `sweeper` keeps sweeping on
//! an interval until Ctrl-C, then waits for the running pass to finish.
//!
//! Carts locked by a live request are skipped and picked up next pass. Run
//! with the `redis` feature and `CART_REDIS_URL` so the sweeper shares locks
//! with the serving instances.

use std::time::Duration;

use super::{CommandError, connect, print_report};

/// One sweep over every active cart.
pub async fn once() -> Result<(), CommandError> {
    let engine = connect().await?;
    let report = engine.service().sweep().await?;
    print_report(&report)
}

/// Sweep every `interval` (or the configured default) until interrupted.
pub async fn scheduled(interval: Option<Duration>) -> Result<(), CommandError> {
    let engine = connect().await?;
    let interval = interval.unwrap_or(engine.settings().sync.interval);

    let sweeper = engine.service().sync_engine().spawn_sweeper(interval);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl-C, stopping sweeper");
    }
    tracing::info!("Shutting down sweeper...");
    sweeper.stop().await;
    Ok(())
}
