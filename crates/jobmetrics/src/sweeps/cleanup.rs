//! Age-based cleanup of every stored record family.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::aggregator::WindowedAggregator;
use crate::baseline::BaselineEstimator;
use crate::config::{RetentionConfig, WorkerConfig};
use crate::discovery::QueueDiscovery;
use crate::heartbeat::WorkerHeartbeatTracker;
use crate::recorder::SampleRecorder;

/// Age after which each record family is deleted.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub job_aggregates: Duration,
    pub queue_aggregates: Duration,
    pub baselines: Duration,
    pub workers: Duration,
    pub discovery: Duration,
}

impl CleanupPolicy {
    pub fn from_retention(retention: &RetentionConfig, worker: &WorkerConfig) -> Self {
        Self {
            job_aggregates: retention.aggregated_ttl,
            queue_aggregates: retention.aggregated_ttl,
            baselines: retention.baseline_ttl,
            workers: worker.heartbeat_ttl,
            discovery: retention.aggregated_ttl,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub job_aggregates: usize,
    pub queue_aggregates: usize,
    pub baselines: usize,
    pub workers: usize,
    pub discovery_markers: usize,
    pub failures: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.job_aggregates
            + self.queue_aggregates
            + self.baselines
            + self.workers
            + self.discovery_markers
    }
}

pub struct CleanupTask {
    pub recorder: SampleRecorder,
    pub aggregator: WindowedAggregator,
    pub baselines: BaselineEstimator,
    pub workers: WorkerHeartbeatTracker,
    pub discovery: QueueDiscovery,
    pub policy: CleanupPolicy,
    pub interval: Duration,
}

impl CleanupTask {
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            interval_ms = self.interval.as_millis(),
            aggregate_retention_secs = self.policy.job_aggregates.as_secs(),
            baseline_retention_secs = self.policy.baselines.as_secs(),
            "cleanup task started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// One pass over every record family. A failing family is logged and
    /// the rest still run.
    pub async fn sweep_once(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.recorder.cleanup(self.policy.job_aggregates).await {
            Ok(removed) => report.job_aggregates = removed,
            Err(err) => {
                error!(family = "job_aggregates", error = %err, "cleanup failed");
                report.failures += 1;
            }
        }
        match self.aggregator.cleanup(self.policy.queue_aggregates).await {
            Ok(removed) => report.queue_aggregates = removed,
            Err(err) => {
                error!(family = "queue_aggregates", error = %err, "cleanup failed");
                report.failures += 1;
            }
        }
        match self.baselines.cleanup(self.policy.baselines).await {
            Ok(removed) => report.baselines = removed,
            Err(err) => {
                error!(family = "baselines", error = %err, "cleanup failed");
                report.failures += 1;
            }
        }
        match self.workers.cleanup(self.policy.workers).await {
            Ok(removed) => report.workers = removed,
            Err(err) => {
                error!(family = "workers", error = %err, "cleanup failed");
                report.failures += 1;
            }
        }
        match self.discovery.cleanup(self.policy.discovery).await {
            Ok(removed) => report.discovery_markers = removed,
            Err(err) => {
                error!(family = "discovery", error = %err, "cleanup failed");
                report.failures += 1;
            }
        }

        if report.total_removed() > 0 {
            info!(
                job_aggregates = report.job_aggregates,
                queue_aggregates = report.queue_aggregates,
                baselines = report.baselines,
                workers = report.workers,
                discovery_markers = report.discovery_markers,
                "cleanup removed aged records"
            );
        } else {
            debug!("nothing to clean up");
        }
        report
    }
}
