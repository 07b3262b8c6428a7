//! Background daily reset
//!
//! Spawns a periodic task that runs the pool's date check, so counters clear
//! shortly after UTC midnight even when no traffic arrives. The lazy check in
//! `KeyPool::next` still runs on every selection; this task only moves the
//! reset earlier.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::KeyPool;

/// Spawn a task that calls `KeyPool::maybe_reset` every `interval`.
///
/// Returns a `JoinHandle` for the spawned task; abort it to stop the ticker.
pub fn spawn_reset_task(pool: Arc<KeyPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick; the pool was just constructed
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if pool.maybe_reset().await {
                info!("background daily reset applied");
            } else {
                debug!("reset check: same day, nothing to do");
            }
        }
    })
}
