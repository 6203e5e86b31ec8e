//! Periodic queue aggregation.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::aggregator::{AggregationReport, WindowedAggregator};
use crate::error::MetricsResult;

pub struct AggregationTask {
    pub aggregator: WindowedAggregator,
    pub interval: Duration,
}

impl AggregationTask {
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            interval_ms = self.interval.as_millis(),
            "aggregation task started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("aggregation task shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = ?err, "aggregation sweep failed");
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> MetricsResult<AggregationReport> {
        let report = self.aggregator.aggregate_all().await?;
        if report.aggregated == 0 && report.failed.is_empty() {
            debug!("no queues to aggregate");
        } else {
            info!(
                aggregated = report.aggregated,
                failed = report.failed.len(),
                "aggregation sweep finished"
            );
        }
        Ok(report)
    }
}
