//! Baseline recalculation with a per-queue cadence.
//!
//! The task wakes every tick and recalculates only the queues that are due.
//! After each recalculation the next due time is picked from the baseline's
//! age-decayed confidence: uncertain baselines are refreshed every few
//! minutes, confident ones hourly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobmetrics_core::{QueueKey, SharedClock};
use tracing::{debug, error, info};

use crate::baseline::BaselineEstimator;
use crate::discovery::QueueDiscovery;
use crate::error::MetricsResult;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineSweepReport {
    pub recalculated: usize,
    pub not_due: usize,
    pub failed: Vec<QueueKey>,
}

pub struct BaselineTask {
    estimator: BaselineEstimator,
    discovery: QueueDiscovery,
    clock: SharedClock,
    tick: Duration,
    next_due: HashMap<QueueKey, DateTime<Utc>>,
}

impl BaselineTask {
    pub fn new(
        estimator: BaselineEstimator,
        discovery: QueueDiscovery,
        clock: SharedClock,
        tick: Duration,
    ) -> Self {
        Self {
            estimator,
            discovery,
            clock,
            tick,
            next_due: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(tick_ms = self.tick.as_millis(), "baseline task started");

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("baseline task shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.tick) => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = ?err, "baseline sweep failed");
                    }
                }
            }
        }
    }

    /// When `queue` is next due, if it has been calculated before.
    pub fn next_due(&self, queue: &QueueKey) -> Option<DateTime<Utc>> {
        self.next_due.get(queue).copied()
    }

    pub async fn sweep_once(&mut self) -> MetricsResult<BaselineSweepReport> {
        let now = self.clock.now();
        let queues = self.discovery.list_queues().await?;
        let mut report = BaselineSweepReport::default();

        for queue in &queues {
            if self.next_due.get(queue).is_some_and(|due| *due > now) {
                report.not_due += 1;
                continue;
            }
            match self
                .estimator
                .calculate_for_queue(&queue.connection, &queue.queue)
                .await
            {
                Ok(estimate) => {
                    let wait = self.estimator.next_recalculation(estimate.as_ref());
                    let wait = TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero());
                    self.next_due.insert(queue.clone(), now + wait);
                    report.recalculated += 1;
                }
                Err(err) => {
                    // Left due, so the next tick retries it.
                    error!(
                        connection = %queue.connection,
                        queue = %queue.queue,
                        error = %err,
                        "baseline recalculation failed"
                    );
                    report.failed.push(queue.clone());
                }
            }
        }

        let known: HashSet<&QueueKey> = queues.iter().collect();
        self.next_due.retain(|queue, _| known.contains(queue));

        if report.recalculated > 0 || !report.failed.is_empty() {
            info!(
                recalculated = report.recalculated,
                not_due = report.not_due,
                failed = report.failed.len(),
                "baseline sweep finished"
            );
        } else {
            debug!(not_due = report.not_due, "no baselines due");
        }
        Ok(report)
    }
}
