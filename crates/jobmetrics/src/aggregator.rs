//! Windowed throughput and duration, rolled up from job identities to
//! queues.
//!
//! Queue aggregates mix two horizons: throughput and average duration cover
//! the trailing minute, while the failure rate comes from lifetime counters.
//! A queue that failed heavily last week still reports that rate today.

use std::time::Duration;

use jobmetrics_core::time::{cutoff, to_score};
use jobmetrics_core::{
    JobAggregate, JobIdentity, KeyLayout, QueueAggregate, QueueKey, SampleKind, SharedClock,
    TrendDirection,
};
use jobmetrics_kv_store::{Batch, SharedStore};
use tracing::{debug, error, warn};

use crate::config::RetentionConfig;
use crate::discovery::QueueDiscovery;
use crate::error::{MetricsError, MetricsResult};
use crate::series;

/// Window used for queue roll-ups.
pub const AGGREGATION_WINDOW_SECS: u64 = 60;

/// Snapshots kept per queue: one day at one-minute aggregation.
pub const QUEUE_HISTORY_LIMIT: usize = 1440;

/// Snapshots compared when classifying a queue's trend.
pub const TREND_SAMPLE_SIZE: usize = 60;

/// Outcome of one pass over every known queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReport {
    pub aggregated: usize,
    pub failed: Vec<QueueKey>,
}

#[derive(Clone)]
pub struct WindowedAggregator {
    store: SharedStore,
    keys: KeyLayout,
    clock: SharedClock,
    discovery: QueueDiscovery,
    retention: RetentionConfig,
}

impl WindowedAggregator {
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        clock: SharedClock,
        discovery: QueueDiscovery,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            discovery,
            retention,
        }
    }

    async fn window_durations(
        &self,
        identity: &JobIdentity,
        window_seconds: u64,
    ) -> MetricsResult<Vec<f64>> {
        let now = self.clock.now();
        let from = cutoff(now, Duration::from_secs(window_seconds));
        let key = self.keys.samples(SampleKind::Duration, identity);
        series::window(&*self.store, &key, from, now).await
    }

    /// Completions within `[now - window, now]`. Not normalized to a minute.
    pub async fn throughput(
        &self,
        identity: &JobIdentity,
        window_seconds: u64,
    ) -> MetricsResult<u64> {
        Ok(self.window_durations(identity, window_seconds).await?.len() as u64)
    }

    /// Mean duration within the window, 0.0 without samples.
    pub async fn average_duration_in_window(
        &self,
        identity: &JobIdentity,
        window_seconds: u64,
    ) -> MetricsResult<f64> {
        let durations = self.window_durations(identity, window_seconds).await?;
        Ok(jobmetrics_core::stats::mean(&durations))
    }

    /// Recompute and overwrite the aggregate for one queue.
    pub async fn aggregate_queue(
        &self,
        connection: &str,
        queue: &str,
    ) -> MetricsResult<QueueAggregate> {
        let queue = QueueKey::new(connection, queue)?;
        let now = self.clock.now();
        let mut result = QueueAggregate::empty(queue.clone(), now);

        let mut weighted_duration = 0.0;
        for identity in self.discovery.list_jobs_for_queue(&queue).await? {
            let durations = self
                .window_durations(&identity, AGGREGATION_WINDOW_SECS)
                .await?;
            let throughput = durations.len() as f64;
            weighted_duration += throughput * jobmetrics_core::stats::mean(&durations);
            result.throughput_per_minute += throughput;

            let key = self.keys.job_aggregate(&identity);
            let map = self.store.hash_get_all(&key).await?;
            if let Some(aggregate) =
                JobAggregate::from_hash(&map).map_err(|err| MetricsError::corrupt(&key, err))?
            {
                result.total_processed += aggregate.total_processed;
                result.total_failed += aggregate.total_failed;
                result.last_processed_at =
                    result.last_processed_at.max(aggregate.last_processed_at);
            }
        }

        if result.throughput_per_minute > 0.0 {
            result.avg_duration_ms = weighted_duration / result.throughput_per_minute;
        }
        let attempts = result.total_processed + result.total_failed;
        if attempts > 0 {
            result.failure_rate_percent = 100.0 * result.total_failed as f64 / attempts as f64;
        }

        self.store_aggregate(&result).await?;
        Ok(result)
    }

    async fn store_aggregate(&self, aggregate: &QueueAggregate) -> MetricsResult<()> {
        let key = self.keys.queue_aggregate(&aggregate.queue);
        let history_key = self.keys.queue_history(&aggregate.queue);
        let snapshot = serde_json::to_string(aggregate)
            .map_err(jobmetrics_backends_core::BackendError::from)?;
        let ttl = self.retention.aggregated_ttl;

        let mut batch = Batch::new();
        batch
            .delete(&key)
            .hash_set(&key, aggregate.to_fields())
            .expire(&key, ttl)
            .sorted_add(&history_key, snapshot, to_score(aggregate.recorded_at))
            .sorted_trim_to_newest(&history_key, QUEUE_HISTORY_LIMIT)
            .expire(&history_key, ttl);
        self.store.execute(batch).await?;
        Ok(())
    }

    /// Aggregate every discovered queue. A failing queue is logged and
    /// skipped.
    pub async fn aggregate_all(&self) -> MetricsResult<AggregationReport> {
        let mut report = AggregationReport::default();
        for queue in self.discovery.list_queues().await? {
            match self.aggregate_queue(&queue.connection, &queue.queue).await {
                Ok(aggregate) => {
                    debug!(
                        connection = %queue.connection,
                        queue = %queue.queue,
                        throughput_per_minute = aggregate.throughput_per_minute,
                        avg_duration_ms = aggregate.avg_duration_ms,
                        failure_rate_percent = aggregate.failure_rate_percent,
                        "aggregated queue"
                    );
                    report.aggregated += 1;
                }
                Err(err) => {
                    error!(
                        connection = %queue.connection,
                        queue = %queue.queue,
                        error = %err,
                        "queue aggregation failed"
                    );
                    report.failed.push(queue);
                }
            }
        }
        Ok(report)
    }

    pub async fn get_latest_queue_metrics(
        &self,
        connection: &str,
        queue: &str,
    ) -> MetricsResult<Option<QueueAggregate>> {
        let queue = QueueKey::new(connection, queue)?;
        let key = self.keys.queue_aggregate(&queue);
        let map = self.store.hash_get_all(&key).await?;
        QueueAggregate::from_hash(&map).map_err(|err| MetricsError::corrupt(&key, err))
    }

    /// Up to `limit` newest snapshots, oldest first.
    pub async fn queue_history(
        &self,
        connection: &str,
        queue: &str,
        limit: usize,
    ) -> MetricsResult<Vec<QueueAggregate>> {
        let queue = QueueKey::new(connection, queue)?;
        let key = self.keys.queue_history(&queue);
        let mut snapshots = Vec::new();
        for entry in self.store.sorted_newest(&key, limit).await? {
            match serde_json::from_str::<QueueAggregate>(&entry.member) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable queue snapshot"),
            }
        }
        snapshots.reverse();
        Ok(snapshots)
    }

    /// Throughput direction over the most recent snapshots.
    pub async fn queue_trend(
        &self,
        connection: &str,
        queue: &str,
    ) -> MetricsResult<TrendDirection> {
        let history = self
            .queue_history(connection, queue, TREND_SAMPLE_SIZE)
            .await?;
        let throughput: Vec<f64> = history
            .iter()
            .map(|snapshot| snapshot.throughput_per_minute)
            .collect();
        Ok(TrendDirection::from_series(&throughput))
    }

    /// Delete queue aggregates, and their history, last written before
    /// `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> MetricsResult<usize> {
        let threshold = cutoff(self.clock.now(), older_than);
        let mut removed = 0;
        for key in self.store.scan_keys(&self.keys.queue_aggregate_pattern()).await? {
            let map = self.store.hash_get_all(&key).await?;
            let aggregate = match QueueAggregate::from_hash(&map) {
                Ok(Some(aggregate)) => aggregate,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable queue aggregate");
                    continue;
                }
            };
            if aggregate.recorded_at >= threshold {
                continue;
            }
            let mut batch = Batch::new();
            batch
                .delete(&key)
                .delete(self.keys.queue_history(&aggregate.queue));
            self.store.execute(batch).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "removed aged queue aggregates");
        }
        Ok(removed)
    }
}
