//! Periodic crash detection for silent workers.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::MetricsResult;
use crate::heartbeat::WorkerHeartbeatTracker;

pub struct StaleWorkerTask {
    pub tracker: WorkerHeartbeatTracker,
    pub interval: Duration,
}

impl StaleWorkerTask {
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            interval_ms = self.interval.as_millis(),
            stale_after_secs = self.tracker.config().stale_after.as_secs(),
            "stale worker task started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("stale worker task shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = ?err, "stale worker sweep failed");
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> MetricsResult<usize> {
        let crashed = self
            .tracker
            .detect_stale_workers(self.tracker.config().stale_after)
            .await?;
        if crashed > 0 {
            info!(crashed, "marked stale workers crashed");
        } else {
            debug!("no stale workers");
        }
        Ok(crashed)
    }
}
