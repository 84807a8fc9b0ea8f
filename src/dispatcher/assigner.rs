//! Revision placement loop.
//!
//! A single task pulls pending revisions and offers each to an idle runner
//! chosen by round-robin. The busy flag is claimed before any network I/O;
//! the assigner is the only writer of assignments in the forward direction.

use crate::dispatcher::protocol::RunnerKey;
use crate::dispatcher::state::Scheduler;
use crate::net::send_line;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Pulls pending revisions and places each one, forever. Returns when the
/// queue's send side is gone (process shutdown).
pub async fn run_assigner(sched: Arc<Scheduler>, mut queue_rx: mpsc::UnboundedReceiver<String>) {
    let tick = sched.config().assign_tick;
    loop {
        let revision = match timeout(tick, queue_rx.recv()).await {
            Ok(Some(revision)) => revision,
            Ok(None) => return,
            // tick elapsed with nothing queued
            Err(_) => continue,
        };
        sched.note_dequeued();
        assign(&sched, &revision).await;
    }
}

/// Places one revision: wait for an idle runner, claim it, offer the work.
async fn assign(sched: &Scheduler, revision: &str) {
    let tick = sched.config().assign_tick;
    let runner = loop {
        if let Some(runner) = sched.pick_idle_round_robin().await {
            break runner;
        }
        sleep(tick).await;
    };

    // claim eagerly so nothing else can land on this runner while the offer
    // is on the wire
    sched.set_busy(&runner, true).await;

    match offer(sched, &runner, revision).await {
        Ok(reply) if reply == "OK" => {
            sched.mark_assigned(revision, &runner).await;
        }
        Ok(reply) => {
            // BUSY, ERR, empty: the runner is alive but refused
            sched.set_busy(&runner, false).await;
            sched
                .requeue(revision, &format!("runner {} refused: {:?}", runner, reply))
                .await;
        }
        Err(err) => {
            tracing::debug!(runner = %runner, "RUN offer failed: {:#}", err);
            // the revision is not in the assignment map yet, so eviction
            // cannot requeue it; do that separately
            sched
                .evict(&runner, &format!("RUN offer failed: {:#}", err))
                .await;
            sched.requeue(revision, "runner unreachable").await;
        }
    }
}

/// Sends `RUN <revision>` to the runner and returns its reply line.
async fn offer(sched: &Scheduler, runner: &RunnerKey, revision: &str) -> Result<String> {
    send_line(
        &runner.addr(),
        &format!("RUN {}", revision),
        sched.config().run_timeout,
    )
    .await
}
