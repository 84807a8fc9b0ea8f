//! Scheduler state: the dispatcher's view of runners and revisions.
//!
//! One mutex guards the runner table, the round-robin ring, the assignment
//! map and the per-revision task and timeline records. The pending queue is
//! a channel owned alongside the mutex but never used while it is held:
//! every operation computes its queue pushes under the lock and performs
//! them after the guard is dropped, so critical sections stay free of I/O,
//! file writes and logging.

use crate::config::DispatcherConfig;
use crate::dispatcher::protocol::RunnerKey;
use crate::events::{CiEvent, EventJournal};
use crate::logging::ci_log;
use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// Liveness and occupancy of one registered runner.
#[derive(Debug, Clone)]
struct RunnerEntry {
    busy: bool,
    last_seen: Instant,
}

/// Requeue bookkeeping for one revision. Lives until the revision is dropped
/// at the retry cap; completion leaves it in place so a re-submission keeps
/// its history.
#[derive(Debug, Clone, Default)]
struct TaskRecord {
    retry_count: u32,
}

/// Wall-clock milestones of one revision, kept only to emit the result file.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub queued_at: Option<DateTime<Local>>,
    pub assigned_at: Option<DateTime<Local>>,
    pub completed_at: Option<DateTime<Local>>,
    pub runner: Option<RunnerKey>,
}

#[derive(Default)]
struct SchedulerState {
    runners: HashMap<RunnerKey, RunnerEntry>,
    ring: VecDeque<RunnerKey>,
    assignments: HashMap<String, RunnerKey>,
    tasks: HashMap<String, TaskRecord>,
    timelines: HashMap<String, Timeline>,
}

/// What the caller must do for a revision once the lock is released.
enum RequeueOutcome {
    Requeued { retry: u32 },
    Dropped { retries: u32 },
}

impl SchedulerState {
    /// Requeue procedure: pull the revision out of the assignment map, bump
    /// its retry count, and report whether it goes back on the queue or is
    /// dropped at the cap. The queue push itself happens lock-free.
    fn requeue_locked(&mut self, revision: &str, retry_max: u32) -> RequeueOutcome {
        self.assignments.remove(revision);
        let retry_count = self
            .tasks
            .get(revision)
            .map(|record| record.retry_count)
            .unwrap_or(0);
        if retry_count >= retry_max {
            self.tasks.remove(revision);
            self.timelines.remove(revision);
            RequeueOutcome::Dropped {
                retries: retry_count,
            }
        } else {
            self.tasks.insert(
                revision.to_string(),
                TaskRecord {
                    retry_count: retry_count + 1,
                },
            );
            RequeueOutcome::Requeued {
                retry: retry_count + 1,
            }
        }
    }
}

/// Shared scheduling engine handed to the protocol server, the assigner and
/// the janitor.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    queue_tx: mpsc::UnboundedSender<String>,
    /// Revisions currently sitting in the queue; kept outside the channel so
    /// STATUS can report a pending count from inside the critical section.
    pending: AtomicUsize,
    journal: EventJournal,
    config: DispatcherConfig,
}

impl Scheduler {
    /// Creates the scheduler and hands back the receiving end of the pending
    /// queue for the assigner.
    pub fn new(
        config: DispatcherConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<String>)> {
        let journal = EventJournal::open(&config.results_dir)?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(Self {
                state: Mutex::new(SchedulerState::default()),
                queue_tx,
                pending: AtomicUsize::new(0),
                journal,
                config,
            }),
            queue_rx,
        ))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn log(&self, tag: &str, msg: &str) {
        ci_log(&self.config.results_dir, tag, msg);
    }

    /// Pushes a revision onto the pending queue. Must not be called while
    /// the state lock is held.
    fn enqueue(&self, revision: String) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(revision).is_err() {
            // receiver gone, which only happens during shutdown
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Balances the pending counter after the assigner pops a revision.
    pub fn note_dequeued(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Registers a runner. A second register is a no-op: neither the table
    /// entry nor the ring position is disturbed.
    pub async fn register(&self, key: RunnerKey) {
        {
            let mut state = self.state.lock().await;
            if state.runners.contains_key(&key) {
                return;
            }
            state.runners.insert(
                key.clone(),
                RunnerEntry {
                    busy: false,
                    last_seen: Instant::now(),
                },
            );
            state.ring.push_back(key.clone());
        }
        self.journal.record(CiEvent::RunnerRegistered {
            runner: key.to_string(),
        });
        self.log("dispatcher", &format!("runner {} registered", key));
    }

    /// Refreshes a runner's liveness stamp. Unknown runners are ignored: an
    /// evicted runner is expected to re-register, not resurrect here.
    pub async fn heartbeat(&self, key: &RunnerKey) {
        let mut state = self.state.lock().await;
        match state.runners.get_mut(key) {
            Some(entry) => entry.last_seen = Instant::now(),
            None => tracing::debug!(runner = %key, "heartbeat from unknown runner"),
        }
    }

    /// Queues a revision for assignment. Repeat submissions keep the
    /// existing retry count but refresh `queued_at`.
    pub async fn dispatch(&self, revision: &str) {
        let retry = {
            let mut state = self.state.lock().await;
            let retry = state
                .tasks
                .entry(revision.to_string())
                .or_default()
                .retry_count;
            state
                .timelines
                .entry(revision.to_string())
                .or_default()
                .queued_at = Some(Local::now());
            retry
        };
        self.enqueue(revision.to_string());
        self.journal.record(CiEvent::RevisionQueued {
            commit: revision,
            retry,
        });
        self.log("dispatcher", &format!("revision {} queued", revision));
    }

    /// Consistent snapshot of (runners, pending, assigned) for `STATUS`.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        let pending = self.pending.load(Ordering::SeqCst);
        (state.runners.len(), pending, state.assignments.len())
    }

    /// Probes up to one full rotation of the ring and returns the first idle
    /// runner. The ring rotates one position per probe whether or not the
    /// probe succeeds, so the next search starts one position further on.
    pub async fn pick_idle_round_robin(&self) -> Option<RunnerKey> {
        let mut state = self.state.lock().await;
        for _ in 0..state.ring.len() {
            let key = state.ring.pop_front()?;
            state.ring.push_back(key.clone());
            if let Some(entry) = state.runners.get(&key) {
                if !entry.busy {
                    return Some(key);
                }
            }
        }
        None
    }

    /// Flips a runner's busy flag; a vanished runner is a no-op.
    pub async fn set_busy(&self, key: &RunnerKey, busy: bool) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.runners.get_mut(key) {
            entry.busy = busy;
        }
    }

    /// Records that a runner accepted a revision: an assignment map entry
    /// plus `assigned_at` and the runner on the timeline.
    pub async fn mark_assigned(&self, revision: &str, key: &RunnerKey) {
        {
            let mut state = self.state.lock().await;
            state
                .assignments
                .insert(revision.to_string(), key.clone());
            let timeline = state.timelines.entry(revision.to_string()).or_default();
            timeline.assigned_at = Some(Local::now());
            timeline.runner = Some(key.clone());
        }
        self.journal.record(CiEvent::RevisionAssigned {
            commit: revision,
            runner: key.to_string(),
        });
        self.log("assigner", &format!("revision {} assigned to {}", revision, key));
    }

    /// Puts a revision back on the queue after a failed placement, or drops
    /// it once the retry cap is reached.
    pub async fn requeue(&self, revision: &str, reason: &str) {
        let outcome = {
            let mut state = self.state.lock().await;
            state.requeue_locked(revision, self.config.retry_max)
        };
        self.finish_requeue(revision, reason, outcome);
    }

    /// Removes a runner from the table and the ring and requeues everything
    /// it had in flight. Safe to call for runners that are already gone.
    pub async fn evict(&self, key: &RunnerKey, reason: &str) {
        let (existed, outcomes) = {
            let mut state = self.state.lock().await;
            let orphaned: Vec<String> = state
                .assignments
                .iter()
                .filter(|(_, runner)| *runner == key)
                .map(|(revision, _)| revision.clone())
                .collect();
            let mut outcomes = Vec::with_capacity(orphaned.len());
            for revision in orphaned {
                let outcome = state.requeue_locked(&revision, self.config.retry_max);
                outcomes.push((revision, outcome));
            }
            let existed = state.runners.remove(key).is_some();
            state.ring.retain(|k| k != key);
            (existed, outcomes)
        };
        if existed {
            self.journal.record(CiEvent::RunnerEvicted {
                runner: key.to_string(),
                reason,
            });
            self.log("dispatcher", &format!("runner {} evicted: {}", key, reason));
        }
        for (revision, outcome) in outcomes {
            self.finish_requeue(&revision, reason, outcome);
        }
    }

    /// Applies a RESULT line: frees the runner, completes the timeline and
    /// hands back a snapshot for the result file. Unknown revisions still
    /// get a timeline with `completed_at` so a file can be written.
    pub async fn complete(&self, revision: &str, status: &str) -> Timeline {
        let timeline = {
            let mut state = self.state.lock().await;
            if let Some(runner) = state.assignments.remove(revision) {
                if let Some(entry) = state.runners.get_mut(&runner) {
                    entry.busy = false;
                }
            }
            let timeline = state.timelines.entry(revision.to_string()).or_default();
            timeline.completed_at = Some(Local::now());
            timeline.clone()
        };
        self.journal.record(CiEvent::RevisionCompleted {
            commit: revision,
            status,
        });
        self.log(
            "dispatcher",
            &format!("revision {} completed: {}", revision, status),
        );
        timeline
    }

    /// Runners whose last heartbeat is older than the dead threshold.
    pub async fn dead_runners(&self) -> Vec<RunnerKey> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .runners
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > self.config.dead_after)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Queue push and bookkeeping shared by `requeue` and `evict`; called
    /// with the state lock released.
    fn finish_requeue(&self, revision: &str, reason: &str, outcome: RequeueOutcome) {
        match outcome {
            RequeueOutcome::Requeued { retry } => {
                self.enqueue(revision.to_string());
                self.journal.record(CiEvent::RevisionQueued {
                    commit: revision,
                    retry,
                });
                self.log(
                    "dispatcher",
                    &format!("revision {} requeued (retry {}): {}", revision, retry, reason),
                );
            }
            RequeueOutcome::Dropped { retries } => {
                self.journal.record(CiEvent::RevisionDropped {
                    commit: revision,
                    retries,
                    reason,
                });
                self.log(
                    "dispatcher",
                    &format!(
                        "revision {} dropped after {} retries: {}",
                        revision, retries, reason
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
impl Scheduler {
    /// Runner table keys and ring contents, in ring order.
    pub(crate) async fn table_and_ring(&self) -> (Vec<RunnerKey>, Vec<RunnerKey>) {
        let state = self.state.lock().await;
        (
            state.runners.keys().cloned().collect(),
            state.ring.iter().cloned().collect(),
        )
    }

    pub(crate) async fn retry_count(&self, revision: &str) -> Option<u32> {
        self.state
            .lock()
            .await
            .tasks
            .get(revision)
            .map(|record| record.retry_count)
    }

    pub(crate) async fn assigned_to(&self, revision: &str) -> Option<RunnerKey> {
        self.state.lock().await.assignments.get(revision).cloned()
    }

    pub(crate) async fn is_busy(&self, key: &RunnerKey) -> Option<bool> {
        self.state
            .lock()
            .await
            .runners
            .get(key)
            .map(|entry| entry.busy)
    }

    pub(crate) async fn timeline(&self, revision: &str) -> Option<Timeline> {
        self.state.lock().await.timelines.get(revision).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_scheduler(
        retry_max: u32,
    ) -> (TempDir, Arc<Scheduler>, mpsc::UnboundedReceiver<String>) {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            retry_max,
            results_dir: dir.path().to_path_buf(),
            ..DispatcherConfig::default()
        };
        let (sched, queue_rx) = Scheduler::new(config).unwrap();
        (dir, sched, queue_rx)
    }

    fn key(port: u16) -> RunnerKey {
        RunnerKey::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.register(key(9001)).await;
        sched.register(key(9001)).await;

        let (table, ring) = sched.table_and_ring().await;
        assert_eq!(table.len(), 1);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_runner_is_ignored() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.heartbeat(&key(9001)).await;

        let (table, ring) = sched.table_and_ring().await;
        assert!(table.is_empty());
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn pick_on_empty_ring_returns_none() {
        let (_dir, sched, _rx) = test_scheduler(3);
        assert_eq!(sched.pick_idle_round_robin().await, None);
    }

    #[tokio::test]
    async fn pick_rotates_between_idle_runners() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.register(key(9001)).await;
        sched.register(key(9002)).await;

        let first = sched.pick_idle_round_robin().await.unwrap();
        let second = sched.pick_idle_round_robin().await.unwrap();
        assert_ne!(first, second);

        let third = sched.pick_idle_round_robin().await.unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn pick_skips_busy_runners() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.register(key(9001)).await;
        sched.register(key(9002)).await;
        sched.set_busy(&key(9001), true).await;

        assert_eq!(sched.pick_idle_round_robin().await, Some(key(9002)));
        assert_eq!(sched.pick_idle_round_robin().await, Some(key(9002)));

        sched.set_busy(&key(9002), true).await;
        assert_eq!(sched.pick_idle_round_robin().await, None);
    }

    #[tokio::test]
    async fn set_busy_on_unknown_runner_is_a_noop() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.set_busy(&key(9001), true).await;
        assert_eq!(sched.is_busy(&key(9001)).await, None);
    }

    #[tokio::test]
    async fn dispatch_twice_keeps_one_record_and_refreshes_queued_at() {
        let (_dir, sched, mut rx) = test_scheduler(3);
        sched.dispatch("c1").await;
        let first_queued = sched.timeline("c1").await.unwrap().queued_at.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        sched.dispatch("c1").await;

        assert_eq!(sched.retry_count("c1").await, Some(0));
        let second_queued = sched.timeline("c1").await.unwrap().queued_at.unwrap();
        assert!(second_queued > first_queued);

        // both submissions reached the queue
        assert_eq!(rx.recv().await.unwrap(), "c1");
        assert_eq!(rx.recv().await.unwrap(), "c1");
    }

    #[tokio::test]
    async fn requeue_increments_until_the_cap_then_drops() {
        let (_dir, sched, mut rx) = test_scheduler(3);
        sched.dispatch("c1").await;
        assert_eq!(rx.recv().await.unwrap(), "c1");
        sched.note_dequeued();

        for attempt in 1..=3 {
            sched.requeue("c1", "test failure").await;
            assert_eq!(rx.recv().await.unwrap(), "c1");
            sched.note_dequeued();
            assert_eq!(sched.retry_count("c1").await, Some(attempt));
        }

        // already at the cap: dropped, nothing queued, records discarded
        sched.requeue("c1", "test failure").await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sched.retry_count("c1").await, None);
        assert!(sched.timeline("c1").await.is_none());

        let (_, pending, assigned) = sched.counts().await;
        assert_eq!((pending, assigned), (0, 0));
    }

    #[tokio::test]
    async fn evict_requeues_in_flight_work_and_clears_the_runner() {
        let (_dir, sched, mut rx) = test_scheduler(3);
        sched.register(key(9001)).await;
        sched.dispatch("c1").await;
        assert_eq!(rx.recv().await.unwrap(), "c1");
        sched.note_dequeued();

        sched.set_busy(&key(9001), true).await;
        sched.mark_assigned("c1", &key(9001)).await;
        assert_eq!(sched.assigned_to("c1").await, Some(key(9001)));

        sched.evict(&key(9001), "heartbeat timeout").await;

        assert_eq!(rx.recv().await.unwrap(), "c1");
        assert_eq!(sched.retry_count("c1").await, Some(1));
        assert_eq!(sched.assigned_to("c1").await, None);
        let (table, ring) = sched.table_and_ring().await;
        assert!(table.is_empty());
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn evicting_an_unknown_runner_is_tolerated() {
        let (_dir, sched, _rx) = test_scheduler(3);
        sched.evict(&key(9001), "nobody home").await;
        let (table, ring) = sched.table_and_ring().await;
        assert!(table.is_empty());
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn complete_frees_the_runner_and_stamps_the_timeline() {
        let (_dir, sched, mut rx) = test_scheduler(3);
        sched.register(key(9001)).await;
        sched.dispatch("c1").await;
        rx.recv().await.unwrap();
        sched.note_dequeued();
        sched.set_busy(&key(9001), true).await;
        sched.mark_assigned("c1", &key(9001)).await;

        let timeline = sched.complete("c1", "OK").await;

        assert!(timeline.queued_at.is_some());
        assert!(timeline.assigned_at.is_some());
        assert!(timeline.completed_at.is_some());
        assert_eq!(timeline.runner, Some(key(9001)));
        assert_eq!(sched.is_busy(&key(9001)).await, Some(false));
        assert_eq!(sched.assigned_to("c1").await, None);
    }

    #[tokio::test]
    async fn complete_for_unknown_revision_builds_a_bare_timeline() {
        let (_dir, sched, _rx) = test_scheduler(3);
        let timeline = sched.complete("ghost", "OK").await;

        assert!(timeline.queued_at.is_none());
        assert!(timeline.assigned_at.is_none());
        assert!(timeline.completed_at.is_some());
        assert!(timeline.runner.is_none());
    }

    #[tokio::test]
    async fn dead_runners_reports_only_stale_heartbeats() {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            dead_after: std::time::Duration::from_millis(50),
            results_dir: dir.path().to_path_buf(),
            ..DispatcherConfig::default()
        };
        let (sched, _rx) = Scheduler::new(config).unwrap();

        sched.register(key(9001)).await;
        sched.register(key(9002)).await;
        assert!(sched.dead_runners().await.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        sched.heartbeat(&key(9002)).await;

        let dead = sched.dead_runners().await;
        assert_eq!(dead, vec![key(9001)]);
    }
}
