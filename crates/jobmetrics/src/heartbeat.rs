//! Worker heartbeat records, state accounting and crash detection.
//!
//! Every read-modify-write of a worker record runs as an [`AtomicScript`], so
//! a heartbeat racing the stale sweep either lands before the crash check
//! (and keeps the worker alive) or after it (and revives it).

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmetrics_core::time::{cutoff, to_score};
use jobmetrics_core::{
    KeyLayout, QueueKey, SharedClock, WorkerHeartbeat, WorkerId, WorkerState, WorkerUpdate,
};
use jobmetrics_kv_store::{
    AtomicScript, BackendError, BackendResult, Batch, ReadView, SharedStore,
};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{MetricsError, MetricsResult};

fn validate_update(update: &WorkerUpdate) -> MetricsResult<()> {
    WorkerId::new(update.worker_id.as_str())?;
    QueueKey::new(update.connection.as_str(), update.queue.as_str())?;
    Ok(())
}

/// Writes shared by every script that stores a worker record.
fn store_record(
    batch: &mut Batch,
    key: &str,
    index: &str,
    record: &WorkerHeartbeat,
    ttl: Duration,
) {
    batch
        .delete(key)
        .hash_set(key, record.to_fields())
        .expire(key, ttl)
        .sorted_add(index, record.worker_id.as_str(), to_score(record.last_heartbeat));
}

fn read_record(view: &dyn ReadView, key: &str) -> BackendResult<Option<WorkerHeartbeat>> {
    let Some(map) = view.hash(key)? else {
        return Ok(None);
    };
    WorkerHeartbeat::from_hash(&map)
        .map_err(|err| BackendError::Message(format!("corrupt worker record at {key}: {err}")))
}

struct HeartbeatScript<'a> {
    key: String,
    index: String,
    update: &'a WorkerUpdate,
    now: DateTime<Utc>,
    ttl: Duration,
}

impl AtomicScript for HeartbeatScript<'_> {
    fn name(&self) -> &'static str {
        "worker_heartbeat"
    }

    fn plan(&self, view: &dyn ReadView) -> BackendResult<Batch> {
        // An unreadable record is replaced rather than wedging the worker.
        let previous = read_record(view, &self.key).unwrap_or(None);
        let record = WorkerHeartbeat::apply(previous.as_ref(), self.update, self.now);
        let mut batch = Batch::new();
        store_record(&mut batch, &self.key, &self.index, &record, self.ttl);
        Ok(batch)
    }
}

struct TransitionScript {
    key: String,
    index: String,
    state: WorkerState,
    at: DateTime<Utc>,
    ttl: Duration,
    /// Only transition when the record has been silent longer than this.
    stale_after: Option<f64>,
}

impl AtomicScript for TransitionScript {
    fn name(&self) -> &'static str {
        "worker_transition"
    }

    fn plan(&self, view: &dyn ReadView) -> BackendResult<Batch> {
        let mut batch = Batch::new();
        let Some(current) = read_record(view, &self.key)? else {
            return Ok(batch);
        };
        if let Some(threshold) = self.stale_after {
            if !current.is_active() || !current.is_stale(threshold, self.at) {
                return Ok(batch);
            }
        }
        let next = current.transition(self.state, self.at);
        store_record(&mut batch, &self.key, &self.index, &next, self.ttl);
        Ok(batch)
    }
}

#[derive(Clone)]
pub struct WorkerHeartbeatTracker {
    store: SharedStore,
    keys: KeyLayout,
    clock: SharedClock,
    config: WorkerConfig,
}

impl WorkerHeartbeatTracker {
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        clock: SharedClock,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Store a heartbeat, carrying accounting forward from the previous one.
    pub async fn record_heartbeat(&self, update: &WorkerUpdate) -> MetricsResult<()> {
        validate_update(update)?;
        let script = HeartbeatScript {
            key: self.keys.worker(&update.worker_id),
            index: self.keys.worker_index(),
            update,
            now: self.clock.now(),
            ttl: self.config.heartbeat_ttl,
        };
        self.store.run_script(&script).await?;
        Ok(())
    }

    /// Move a worker to `state` at `at`. `false` when no record exists.
    pub async fn transition_state(
        &self,
        worker_id: &WorkerId,
        state: WorkerState,
        at: DateTime<Utc>,
    ) -> MetricsResult<bool> {
        let script = TransitionScript {
            key: self.keys.worker(worker_id),
            index: self.keys.worker_index(),
            state,
            at,
            ttl: self.config.heartbeat_ttl,
            stale_after: None,
        };
        let replies = self.store.run_script(&script).await?;
        Ok(!replies.is_empty())
    }

    /// Mark active workers silent for longer than `threshold` as crashed.
    /// Returns how many were marked; already-crashed workers are skipped.
    pub async fn detect_stale_workers(&self, threshold: Duration) -> MetricsResult<usize> {
        let now = self.clock.now();
        let index = self.keys.worker_index();
        let silent_since = cutoff(now, threshold);
        let candidates = self
            .store
            .sorted_range_by_score(&index, f64::NEG_INFINITY, to_score(silent_since))
            .await?;

        let mut crashed = 0;
        let mut orphaned = Batch::new();
        for candidate in candidates {
            let worker_id = match WorkerId::new(candidate.member.as_str()) {
                Ok(worker_id) => worker_id,
                Err(err) => {
                    warn!(
                        member = %candidate.member,
                        error = %err,
                        "dropping invalid worker index entry"
                    );
                    orphaned.sorted_remove(&index, candidate.member);
                    continue;
                }
            };
            let key = self.keys.worker(&worker_id);
            let record = match self.store.hash_get_all(&key).await {
                Ok(record) => record,
                Err(err) if err.is_transient() => return Err(err.into()),
                Err(err) => {
                    warn!(worker_id = %worker_id, error = %err, "failed to read worker record");
                    continue;
                }
            };
            if record.is_empty() {
                orphaned.sorted_remove(&index, candidate.member);
                continue;
            }
            let script = TransitionScript {
                key,
                index: index.clone(),
                state: WorkerState::Crashed,
                at: now,
                ttl: self.config.heartbeat_ttl,
                stale_after: Some(threshold.as_secs_f64()),
            };
            match self.store.run_script(&script).await {
                Ok(replies) if !replies.is_empty() => {
                    info!(worker_id = %worker_id, "worker marked crashed after missed heartbeats");
                    crashed += 1;
                }
                Ok(_) => {}
                Err(err) if err.is_transient() => return Err(err.into()),
                Err(err) => {
                    warn!(
                        worker_id = %worker_id,
                        error = %err,
                        "failed to check worker for staleness"
                    );
                }
            }
        }
        if !orphaned.is_empty() {
            debug!(removed = orphaned.len(), "pruned worker index");
            self.store.execute(orphaned).await?;
        }
        Ok(crashed)
    }

    pub async fn get_worker(
        &self,
        worker_id: &WorkerId,
    ) -> MetricsResult<Option<WorkerHeartbeat>> {
        let key = self.keys.worker(worker_id);
        let map = self.store.hash_get_all(&key).await?;
        WorkerHeartbeat::from_hash(&map).map_err(|err| MetricsError::corrupt(&key, err))
    }

    async fn indexed_workers(&self) -> MetricsResult<Vec<WorkerHeartbeat>> {
        let members = self
            .store
            .sorted_range_by_score(&self.keys.worker_index(), f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        let mut workers = Vec::with_capacity(members.len());
        for entry in members {
            let Ok(worker_id) = WorkerId::new(entry.member.as_str()) else {
                continue;
            };
            match self.get_worker(&worker_id).await {
                Ok(Some(worker)) => workers.push(worker),
                Ok(None) => {}
                Err(MetricsError::Corrupt { key, source }) => {
                    warn!(key = %key, error = %source, "skipping unreadable worker record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(workers)
    }

    /// Idle or busy workers, optionally restricted to a connection and queue.
    pub async fn get_active_workers(
        &self,
        connection: Option<&str>,
        queue: Option<&str>,
    ) -> MetricsResult<Vec<WorkerHeartbeat>> {
        let mut workers: Vec<_> = self
            .indexed_workers()
            .await?
            .into_iter()
            .filter(|worker| worker.is_active() && worker.serves(connection, queue))
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    /// Drop records and index entries silent for longer than `older_than`.
    pub async fn cleanup(&self, older_than: Duration) -> MetricsResult<usize> {
        let index = self.keys.worker_index();
        let threshold = to_score(cutoff(self.clock.now(), older_than));
        let expired = self
            .store
            .sorted_range_by_score(&index, f64::NEG_INFINITY, threshold)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let mut batch = Batch::new();
        for entry in &expired {
            if let Ok(worker_id) = WorkerId::new(entry.member.as_str()) {
                batch.delete(self.keys.worker(&worker_id));
            }
            batch.sorted_remove(&index, entry.member.as_str());
        }
        self.store.execute(batch).await?;
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jobmetrics_backend_memory::MemoryStore;
    use jobmetrics_core::{Clock, ManualClock};

    use super::*;

    fn tracker() -> (WorkerHeartbeatTracker, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (
            WorkerHeartbeatTracker::new(
                store,
                KeyLayout::default(),
                Arc::new(clock.clone()),
                WorkerConfig::default(),
            ),
            clock,
        )
    }

    fn update(worker: &str, queue: &str, state: WorkerState, job: Option<&str>) -> WorkerUpdate {
        WorkerUpdate {
            worker_id: WorkerId::new(worker).expect("worker id"),
            connection: "redis".to_string(),
            queue: queue.to_string(),
            state,
            current_job_id: job.map(str::to_string),
            current_job_class: job.map(|_| "SendEmail".to_string()),
            pid: 4242,
            hostname: "host-a".to_string(),
            memory_usage_mb: 64.0,
            cpu_usage_percent: 12.5,
        }
    }

    #[tokio::test]
    async fn heartbeats_accumulate_state_time() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::new("host-a-1").expect("worker id");

        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Idle, None))
            .await
            .expect("idle");
        clock.advance_secs(10);
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Busy, Some("j1")))
            .await
            .expect("busy");
        clock.advance_secs(5);
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Idle, None))
            .await
            .expect("idle again");

        let record = tracker.get_worker(&worker).await.expect("read").expect("record");
        assert_eq!(record.idle_time_seconds, 10.0);
        assert_eq!(record.busy_time_seconds, 5.0);
        assert_eq!(record.jobs_processed, 1);
        assert_eq!(record.last_state_change, clock.now());
        assert_eq!(record.current_job_id, None);
    }

    #[tokio::test]
    async fn rejects_blank_connection() {
        let (tracker, _) = tracker();
        let mut bad = update("host-a-1", "default", WorkerState::Idle, None);
        bad.connection = String::new();
        let err = tracker.record_heartbeat(&bad).await.expect_err("invalid");
        assert!(matches!(err, MetricsError::Validation(_)));
    }

    #[tokio::test]
    async fn transition_of_unknown_worker_is_a_no_op() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::new("ghost-1").expect("worker id");
        let changed = tracker
            .transition_state(&worker, WorkerState::Stopped, clock.now())
            .await
            .expect("transition");
        assert!(!changed);
        assert_eq!(tracker.get_worker(&worker).await.expect("read"), None);
    }

    #[tokio::test]
    async fn stopped_workers_are_not_active() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::new("host-a-1").expect("worker id");
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Busy, Some("j1")))
            .await
            .expect("busy");
        clock.advance_secs(3);
        assert!(
            tracker
                .transition_state(&worker, WorkerState::Stopped, clock.now())
                .await
                .expect("transition")
        );

        let record = tracker.get_worker(&worker).await.expect("read").expect("record");
        assert_eq!(record.state, WorkerState::Stopped);
        assert_eq!(record.busy_time_seconds, 3.0);
        assert_eq!(record.current_job_id, None);
        assert!(
            tracker
                .get_active_workers(None, None)
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn stale_detection_is_idempotent() {
        let (tracker, clock) = tracker();
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Busy, Some("j1")))
            .await
            .expect("heartbeat");
        tracker
            .record_heartbeat(&update("host-a-2", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");

        clock.advance_secs(45);
        tracker
            .record_heartbeat(&update("host-a-2", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        clock.advance_secs(30);

        let threshold = Duration::from_secs(60);
        assert_eq!(tracker.detect_stale_workers(threshold).await.expect("detect"), 1);
        assert_eq!(tracker.detect_stale_workers(threshold).await.expect("detect"), 0);

        let crashed = tracker
            .get_worker(&WorkerId::new("host-a-1").expect("worker id"))
            .await
            .expect("read")
            .expect("record");
        assert_eq!(crashed.state, WorkerState::Crashed);
        assert_eq!(crashed.current_job_id, None);

        let active = tracker.get_active_workers(None, None).await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].worker_id.as_str(), "host-a-2");
    }

    #[tokio::test]
    async fn unreadable_record_does_not_block_stale_detection() {
        let (tracker, clock) = tracker();
        let index = tracker.keys.worker_index();
        let mut seed = Batch::new();
        seed.hash_set(
            tracker.keys.worker(&WorkerId::new("a-bad").expect("worker id")),
            [("worker_id", "a-bad"), ("state", "sleeping")],
        )
        .sorted_add(&index, "a-bad", to_score(clock.now()) - 1_000.0);
        tracker.store.execute(seed).await.expect("seed");

        tracker
            .record_heartbeat(&update("b-good", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        clock.advance_secs(120);

        let threshold = Duration::from_secs(60);
        assert_eq!(tracker.detect_stale_workers(threshold).await.expect("detect"), 1);
        let good = tracker
            .get_worker(&WorkerId::new("b-good").expect("worker id"))
            .await
            .expect("read")
            .expect("record");
        assert_eq!(good.state, WorkerState::Crashed);
    }

    #[tokio::test]
    async fn exactly_at_threshold_is_not_stale() {
        let (tracker, clock) = tracker();
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        clock.advance_secs(60);
        assert_eq!(
            tracker
                .detect_stale_workers(Duration::from_secs(60))
                .await
                .expect("detect"),
            0
        );
    }

    #[tokio::test]
    async fn crashed_worker_revives_on_heartbeat() {
        let (tracker, clock) = tracker();
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        clock.advance_secs(120);
        tracker
            .detect_stale_workers(Duration::from_secs(60))
            .await
            .expect("detect");
        tracker
            .record_heartbeat(&update("host-a-1", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        let active = tracker.get_active_workers(Some("redis"), None).await.expect("list");
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn active_workers_filter_by_queue() {
        let (tracker, _) = tracker();
        for (worker, queue) in [("w-1", "default"), ("w-2", "emails"), ("w-3", "default")] {
            tracker
                .record_heartbeat(&update(worker, queue, WorkerState::Idle, None))
                .await
                .expect("heartbeat");
        }
        let default: Vec<_> = tracker
            .get_active_workers(Some("redis"), Some("default"))
            .await
            .expect("list")
            .into_iter()
            .map(|worker| worker.worker_id.as_str().to_string())
            .collect();
        assert_eq!(default, vec!["w-1", "w-3"]);
        assert!(
            tracker
                .get_active_workers(Some("sqs"), None)
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn cleanup_removes_long_silent_workers() {
        let (tracker, clock) = tracker();
        tracker
            .record_heartbeat(&update("w-1", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");
        clock.advance_secs(600);
        tracker
            .record_heartbeat(&update("w-2", "default", WorkerState::Idle, None))
            .await
            .expect("heartbeat");

        let removed = tracker
            .cleanup(Duration::from_secs(300))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(
            tracker
                .get_worker(&WorkerId::new("w-1").expect("worker id"))
                .await
                .expect("read"),
            None
        );
    }
}
