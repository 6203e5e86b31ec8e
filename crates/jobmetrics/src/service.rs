//! The assembled metrics engine.

use std::sync::Arc;

use jobmetrics_core::{JobEvent, KeyLayout, SharedClock};
use jobmetrics_kv_store::SharedStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::aggregator::WindowedAggregator;
use crate::baseline::BaselineEstimator;
use crate::config::MetricsConfig;
use crate::discovery::QueueDiscovery;
use crate::error::MetricsResult;
use crate::health::{HealthScorer, QueueInspector};
use crate::heartbeat::WorkerHeartbeatTracker;
use crate::recorder::SampleRecorder;
use crate::sweeps::{AggregationTask, BaselineTask, CleanupPolicy, CleanupTask, StaleWorkerTask};
use crate::transforms::TransformPipeline;

/// Every component wired to one store, clock and configuration.
#[derive(Clone)]
pub struct MetricsService {
    pub recorder: SampleRecorder,
    pub discovery: QueueDiscovery,
    pub aggregator: WindowedAggregator,
    pub baselines: BaselineEstimator,
    pub workers: WorkerHeartbeatTracker,
    pub health: HealthScorer,
    clock: SharedClock,
    config: MetricsConfig,
}

impl MetricsService {
    pub fn from_config(
        store: SharedStore,
        clock: SharedClock,
        inspector: Arc<dyn QueueInspector>,
        config: MetricsConfig,
    ) -> Self {
        let keys = KeyLayout::new(config.key_prefix.clone());
        let discovery = QueueDiscovery::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            config.retention.aggregated_ttl,
        );
        let recorder = SampleRecorder::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            discovery.clone(),
            config.retention.clone(),
            config.recorder.clone(),
        );
        let aggregator = WindowedAggregator::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            discovery.clone(),
            config.retention.clone(),
        );
        let baselines = BaselineEstimator::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            discovery.clone(),
            config.retention.clone(),
            config.baseline.clone(),
        );
        let workers =
            WorkerHeartbeatTracker::new(store, keys, clock.clone(), config.worker.clone());
        let health = HealthScorer::new(aggregator.clone(), baselines.clone(), inspector);

        Self {
            recorder,
            discovery,
            aggregator,
            baselines,
            workers,
            health,
            clock,
            config,
        }
    }

    pub fn with_transforms(mut self, transforms: TransformPipeline) -> Self {
        self.recorder = self.recorder.with_transforms(transforms);
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Record a lifecycle event. Failures are logged and swallowed so the
    /// job that produced the event is never affected.
    pub async fn ingest(&self, event: JobEvent) {
        if let Err(err) = self.recorder.record(&event).await {
            warn!(
                kind = event.kind(),
                job_id = %event.job_id(),
                identity = %event.identity(),
                transient = err.is_transient(),
                error = %err,
                "failed to record job event"
            );
        }
    }

    /// Jobs per hour the queue can take in the given headroom, or `None`
    /// without a reliable baseline. Confidence is aged to now first.
    pub async fn estimate_capacity(
        &self,
        connection: &str,
        queue: &str,
        available_cpu_percent: f64,
        available_memory_mb: f64,
    ) -> MetricsResult<Option<u64>> {
        let baseline = self.baselines.get_baseline(connection, queue).await?;
        let now = self.clock.now();
        let half_life = self.config.baseline.confidence_half_life;
        Ok(baseline
            .filter(|baseline| baseline.is_reliable_at(now, half_life))
            .map(|baseline| baseline.estimate_capacity(available_cpu_percent, available_memory_mb)))
    }

    /// Start every background sweep. They stop when `shutdown` is cancelled.
    pub fn spawn_sweeps(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeps = &self.config.sweeps;
        let aggregation = AggregationTask {
            aggregator: self.aggregator.clone(),
            interval: sweeps.aggregation_interval,
        };
        let baseline = BaselineTask::new(
            self.baselines.clone(),
            self.discovery.clone(),
            self.clock.clone(),
            sweeps.baseline_tick,
        );
        let stale = StaleWorkerTask {
            tracker: self.workers.clone(),
            interval: sweeps.stale_check_interval,
        };
        let cleanup = CleanupTask {
            recorder: self.recorder.clone(),
            aggregator: self.aggregator.clone(),
            baselines: self.baselines.clone(),
            workers: self.workers.clone(),
            discovery: self.discovery.clone(),
            policy: CleanupPolicy::from_retention(&self.config.retention, &self.config.worker),
            interval: sweeps.cleanup_interval,
        };

        vec![
            tokio::spawn(aggregation.run(shutdown.clone().cancelled_owned())),
            tokio::spawn(baseline.run(shutdown.clone().cancelled_owned())),
            tokio::spawn(stale.run(shutdown.clone().cancelled_owned())),
            tokio::spawn(cleanup.run(shutdown.clone().cancelled_owned())),
        ]
    }
}
