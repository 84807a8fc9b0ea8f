//! Dead-runner sweeper.
//!
//! Scans the runner table on a fixed tick and evicts anything whose last
//! heartbeat went past the dead threshold. The stale set is snapshotted
//! under the lock; the evictions themselves re-lock one by one so logging
//! never happens inside the critical section.

use crate::dispatcher::state::Scheduler;
use std::sync::Arc;
use tokio::time::interval;

/// Sweeps for dead runners, forever.
pub async fn run_janitor(sched: Arc<Scheduler>) {
    let mut tick = interval(sched.config().janitor_tick);
    loop {
        tick.tick().await;
        for runner in sched.dead_runners().await {
            sched.evict(&runner, "heartbeat timeout").await;
        }
    }
}
