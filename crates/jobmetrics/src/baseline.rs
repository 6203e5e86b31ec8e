//! Per-queue and per-job-class cost baselines.

use std::time::Duration;

use jobmetrics_core::stats::mean;
use jobmetrics_core::time::cutoff;
use jobmetrics_core::{
    BaselineDeviation, BaselineEstimate, BaselineObservation, DeviationMetric, JobIdentity,
    KeyLayout, QueueKey, SampleKind, SharedClock, recalculation_interval,
};
use jobmetrics_kv_store::{Batch, SharedStore};
use tracing::{debug, warn};

use crate::config::{BaselineConfig, RetentionConfig};
use crate::discovery::QueueDiscovery;
use crate::error::{MetricsError, MetricsResult};
use crate::series;

#[derive(Default)]
struct SampleWindow {
    durations: Vec<f64>,
    memory: Vec<f64>,
    cpu: Vec<f64>,
}

impl SampleWindow {
    fn observation(&self) -> Option<BaselineObservation> {
        if self.durations.is_empty() {
            return None;
        }
        Some(BaselineObservation {
            avg_duration_ms: mean(&self.durations),
            memory_mb_per_job: mean(&self.memory),
            cpu_percent_per_job: mean(&self.cpu),
            sample_count: self.durations.len() as u64,
        })
    }

    fn extend(&mut self, other: SampleWindow) {
        self.durations.extend(other.durations);
        self.memory.extend(other.memory);
        self.cpu.extend(other.cpu);
    }
}

#[derive(Clone)]
pub struct BaselineEstimator {
    store: SharedStore,
    keys: KeyLayout,
    clock: SharedClock,
    discovery: QueueDiscovery,
    retention: RetentionConfig,
    config: BaselineConfig,
}

impl BaselineEstimator {
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        clock: SharedClock,
        discovery: QueueDiscovery,
        retention: RetentionConfig,
        config: BaselineConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            discovery,
            retention,
            config,
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    async fn recent_samples(&self, identity: &JobIdentity) -> MetricsResult<SampleWindow> {
        let limit = self.config.sample_limit;
        let store = &*self.store;
        let duration_key = self.keys.samples(SampleKind::Duration, identity);
        let memory_key = self.keys.samples(SampleKind::Memory, identity);
        let cpu_key = self.keys.samples(SampleKind::Cpu, identity);
        Ok(SampleWindow {
            durations: series::newest(store, &duration_key, limit).await?,
            memory: series::newest(store, &memory_key, limit).await?,
            cpu: series::newest(store, &cpu_key, limit).await?,
        })
    }

    /// Refresh the queue baseline and each job-class baseline under it.
    /// `None` when no identity under the queue has samples.
    pub async fn calculate_for_queue(
        &self,
        connection: &str,
        queue: &str,
    ) -> MetricsResult<Option<BaselineEstimate>> {
        let queue = QueueKey::new(connection, queue)?;
        let now = self.clock.now();
        let mut combined = SampleWindow::default();

        for identity in self.discovery.list_jobs_for_queue(&queue).await? {
            let window = self.recent_samples(&identity).await?;
            if let Some(observation) = window.observation() {
                let key = self.keys.job_baseline(&identity);
                let previous = self.read(&key).await?;
                let estimate = BaselineEstimate::blend(
                    previous.as_ref(),
                    &observation,
                    self.config.decay,
                    self.config.target_samples,
                    now,
                );
                self.write(&key, &estimate).await?;
            }
            combined.extend(window);
        }

        let Some(observation) = combined.observation() else {
            debug!(connection = %queue.connection, queue = %queue.queue, "no samples for baseline");
            return Ok(None);
        };
        let key = self.keys.queue_baseline(&queue);
        let previous = self.read(&key).await?;
        let estimate = BaselineEstimate::blend(
            previous.as_ref(),
            &observation,
            self.config.decay,
            self.config.target_samples,
            now,
        );
        self.write(&key, &estimate).await?;
        debug!(
            connection = %queue.connection,
            queue = %queue.queue,
            sample_count = estimate.sample_count,
            confidence = estimate.confidence_score,
            "baseline updated"
        );
        Ok(Some(estimate))
    }

    async fn read(&self, key: &str) -> MetricsResult<Option<BaselineEstimate>> {
        let map = self.store.hash_get_all(key).await?;
        BaselineEstimate::from_hash(&map).map_err(|err| MetricsError::corrupt(key, err))
    }

    async fn write(&self, key: &str, estimate: &BaselineEstimate) -> MetricsResult<()> {
        let mut batch = Batch::new();
        batch
            .delete(key)
            .hash_set(key, estimate.to_fields())
            .expire(key, self.retention.baseline_ttl);
        self.store.execute(batch).await?;
        Ok(())
    }

    pub async fn get_baseline(
        &self,
        connection: &str,
        queue: &str,
    ) -> MetricsResult<Option<BaselineEstimate>> {
        let queue = QueueKey::new(connection, queue)?;
        self.read(&self.keys.queue_baseline(&queue)).await
    }

    pub async fn get_job_class_baseline(
        &self,
        connection: &str,
        queue: &str,
        job_class: &str,
    ) -> MetricsResult<Option<BaselineEstimate>> {
        let identity = JobIdentity::new(connection, queue, job_class)?;
        self.read(&self.keys.job_baseline(&identity)).await
    }

    /// Compare an observation with the stored queue baseline using the
    /// configured threshold. `None` without a usable baseline.
    pub async fn check_deviation(
        &self,
        connection: &str,
        queue: &str,
        metric: DeviationMetric,
        observed: f64,
    ) -> MetricsResult<Option<BaselineDeviation>> {
        let baseline = self.get_baseline(connection, queue).await?;
        Ok(baseline.and_then(|baseline| {
            baseline.deviation(metric, observed, self.config.deviation_threshold)
        }))
    }

    /// Confidence after idle-time decay, as of now.
    pub fn current_confidence(&self, estimate: &BaselineEstimate) -> f64 {
        estimate.aged_confidence(self.clock.now(), self.config.confidence_half_life)
    }

    /// Delay before the next recalculation of a baseline.
    pub fn next_recalculation(&self, estimate: Option<&BaselineEstimate>) -> Duration {
        let confidence = estimate.map_or(0.0, |estimate| self.current_confidence(estimate));
        recalculation_interval(confidence)
    }

    /// Delete baselines last calculated before `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> MetricsResult<usize> {
        let threshold = cutoff(self.clock.now(), older_than);
        let mut batch = Batch::new();
        for key in self.store.scan_keys(&self.keys.baseline_pattern()).await? {
            match self.read(&key).await {
                Ok(Some(estimate)) if estimate.calculated_at < threshold => {
                    batch.delete(key);
                }
                Ok(_) => {}
                Err(MetricsError::Corrupt { key, source }) => {
                    warn!(key = %key, error = %source, "skipping unreadable baseline");
                }
                Err(err) => return Err(err),
            }
        }
        let removed = batch.len();
        if removed > 0 {
            self.store.execute(batch).await?;
            debug!(removed, "removed aged baselines");
        }
        Ok(removed)
    }
}
