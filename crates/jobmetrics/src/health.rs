//! Queue health scoring.
//!
//! A queue starts at 100 and loses points for each signal that looks wrong:
//!
//! - failure rate above the warning level
//! - a backlog that would take too long to drain at the current throughput
//! - pending jobs with no throughput at all
//! - an old pending job
//! - average duration deviating from the queue baseline
//! - falling throughput while jobs are waiting

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobmetrics_core::{DeviationMetric, QueueAggregate, QueueKey, TrendDirection};
use serde::Serialize;
use tracing::debug;

use crate::aggregator::WindowedAggregator;
use crate::baseline::BaselineEstimator;
use crate::error::MetricsResult;

/// Queue depth as reported by the job queue itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub delayed: u64,
    pub reserved: u64,
    /// Age of the oldest job waiting to be picked up.
    pub oldest_pending_age: Option<Duration>,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.pending + self.delayed + self.reserved
    }
}

/// Read-only view of the job queue's native depth counters.
#[async_trait]
pub trait QueueInspector: Send + Sync {
    async fn depth(&self, queue: &QueueKey) -> MetricsResult<QueueDepth>;
}

/// Inspector backed by values set by hand. Unknown queues report zero depth.
#[derive(Debug, Clone, Default)]
pub struct StaticQueueInspector {
    depths: Arc<Mutex<HashMap<QueueKey, QueueDepth>>>,
}

impl StaticQueueInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, queue: QueueKey, depth: QueueDepth) {
        self.depths
            .lock()
            .expect("queue depths poisoned")
            .insert(queue, depth);
    }
}

#[async_trait]
impl QueueInspector for StaticQueueInspector {
    async fn depth(&self, queue: &QueueKey) -> MetricsResult<QueueDepth> {
        Ok(self
            .depths
            .lock()
            .expect("queue depths poisoned")
            .get(queue)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::Healthy
        } else if score >= 50 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Signal levels that cost a queue points.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub failure_rate_warning_percent: f64,
    /// Failure rate is charged one point per percent, up to this cap.
    pub max_failure_penalty: f64,
    pub drain_warning: Duration,
    pub drain_critical: Duration,
    pub oldest_pending_warning: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure_rate_warning_percent: 5.0,
            max_failure_penalty: 40.0,
            drain_warning: Duration::from_secs(10 * 60),
            drain_critical: Duration::from_secs(30 * 60),
            oldest_pending_warning: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue: QueueKey,
    pub score: u8,
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub depth: QueueDepth,
    pub aggregate: Option<QueueAggregate>,
    pub trend: TrendDirection,
}

#[derive(Clone)]
pub struct HealthScorer {
    aggregator: WindowedAggregator,
    baselines: BaselineEstimator,
    inspector: Arc<dyn QueueInspector>,
    thresholds: HealthThresholds,
}

impl HealthScorer {
    pub fn new(
        aggregator: WindowedAggregator,
        baselines: BaselineEstimator,
        inspector: Arc<dyn QueueInspector>,
    ) -> Self {
        Self {
            aggregator,
            baselines,
            inspector,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Score a queue from its latest stored aggregate. Nothing is
    /// recomputed; run the aggregation sweep first for fresh numbers.
    pub async fn score_queue(&self, connection: &str, queue: &str) -> MetricsResult<QueueHealth> {
        let key = QueueKey::new(connection, queue)?;
        let depth = self.inspector.depth(&key).await?;
        let aggregate = self
            .aggregator
            .get_latest_queue_metrics(connection, queue)
            .await?;
        let trend = self.aggregator.queue_trend(connection, queue).await?;

        let mut penalty = 0.0;
        let mut reasons = Vec::new();
        let thresholds = &self.thresholds;

        if let Some(aggregate) = &aggregate {
            if aggregate.failure_rate_percent > thresholds.failure_rate_warning_percent {
                penalty += aggregate
                    .failure_rate_percent
                    .min(thresholds.max_failure_penalty);
                reasons.push(format!(
                    "failure rate {:.1}% above {:.1}%",
                    aggregate.failure_rate_percent, thresholds.failure_rate_warning_percent
                ));
            }

            if aggregate.avg_duration_ms > 0.0 {
                let deviation = self
                    .baselines
                    .check_deviation(
                        connection,
                        queue,
                        DeviationMetric::Duration,
                        aggregate.avg_duration_ms,
                    )
                    .await?;
                if let Some(deviation) = deviation.filter(|d| d.significant) {
                    penalty += 15.0;
                    reasons.push(format!(
                        "average duration {:.0}ms deviates from baseline {:.0}ms",
                        deviation.observed, deviation.baseline
                    ));
                }
            }
        }

        let throughput = aggregate
            .as_ref()
            .map_or(0.0, |aggregate| aggregate.throughput_per_minute);
        if depth.pending > 0 {
            if throughput <= 0.0 {
                penalty += 30.0;
                reasons.push(format!("{} pending jobs with no throughput", depth.pending));
            } else {
                let drain = Duration::from_secs_f64(depth.pending as f64 / throughput * 60.0);
                if drain >= thresholds.drain_critical {
                    penalty += 25.0;
                    reasons.push(format!("backlog needs {}m to drain", drain.as_secs() / 60));
                } else if drain >= thresholds.drain_warning {
                    penalty += 10.0;
                    reasons.push(format!("backlog needs {}m to drain", drain.as_secs() / 60));
                }
            }
            if trend == TrendDirection::Falling {
                penalty += 5.0;
                reasons.push("throughput falling while jobs wait".to_string());
            }
        }

        if let Some(age) = depth
            .oldest_pending_age
            .filter(|age| *age >= thresholds.oldest_pending_warning)
        {
            penalty += 15.0;
            reasons.push(format!("oldest pending job waited {}s", age.as_secs()));
        }

        let score = (100.0 - penalty).clamp(0.0, 100.0).round() as u8;
        let status = HealthStatus::from_score(score);
        debug!(queue = %key, score, status = %status, "scored queue health");
        Ok(QueueHealth {
            queue: key,
            score,
            status,
            reasons,
            depth,
            aggregate,
            trend,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jobmetrics_backend_memory::MemoryStore;
    use jobmetrics_core::{Clock, JobCompleted, JobFailed, JobIdentity, KeyLayout, ManualClock};
    use jobmetrics_kv_store::SharedStore;

    use super::*;
    use crate::config::{BaselineConfig, RecorderConfig, RetentionConfig};
    use crate::discovery::QueueDiscovery;
    use crate::recorder::SampleRecorder;

    struct Fixture {
        clock: ManualClock,
        recorder: SampleRecorder,
        aggregator: WindowedAggregator,
        baselines: BaselineEstimator,
        inspector: StaticQueueInspector,
        scorer: HealthScorer,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let keys = KeyLayout::default();
        let retention = RetentionConfig::default();
        let discovery = QueueDiscovery::new(
            store.clone(),
            keys.clone(),
            Arc::new(clock.clone()),
            retention.aggregated_ttl,
        );
        let recorder = SampleRecorder::new(
            store.clone(),
            keys.clone(),
            Arc::new(clock.clone()),
            discovery.clone(),
            retention.clone(),
            RecorderConfig::default(),
        );
        let aggregator = WindowedAggregator::new(
            store.clone(),
            keys.clone(),
            Arc::new(clock.clone()),
            discovery.clone(),
            retention.clone(),
        );
        let baselines = BaselineEstimator::new(
            store,
            keys,
            Arc::new(clock.clone()),
            discovery,
            retention,
            BaselineConfig::default(),
        );
        let inspector = StaticQueueInspector::new();
        let scorer = HealthScorer::new(
            aggregator.clone(),
            baselines.clone(),
            Arc::new(inspector.clone()),
        );
        Fixture {
            clock,
            recorder,
            aggregator,
            baselines,
            inspector,
            scorer,
        }
    }

    fn queue() -> QueueKey {
        QueueKey::new("redis", "default").expect("queue")
    }

    async fn complete(f: &Fixture, job_id: &str, duration_ms: f64) {
        f.recorder
            .record_completion(&JobCompleted {
                job_id: job_id.to_string(),
                identity: JobIdentity::new("redis", "default", "X").expect("identity"),
                duration_ms,
                memory_mb: 10.0,
                cpu_time_ms: 5.0,
                completed_at: f.clock.now(),
                hostname: None,
            })
            .await
            .expect("complete");
    }

    #[test]
    fn status_bands() {
        assert_eq!(HealthStatus::from_score(100), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(50), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(49), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn quiet_queue_is_healthy() {
        let f = fixture();
        let health = f.scorer.score_queue("redis", "default").await.expect("score");
        assert_eq!(health.score, 100);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.reasons.is_empty());
        assert!(health.aggregate.is_none());
    }

    #[tokio::test]
    async fn stuck_backlog_is_critical() {
        let f = fixture();
        f.inspector.set(
            queue(),
            QueueDepth {
                pending: 500,
                delayed: 0,
                reserved: 0,
                oldest_pending_age: Some(Duration::from_secs(3_600)),
            },
        );
        let health = f.scorer.score_queue("redis", "default").await.expect("score");
        assert_eq!(health.score, 55);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.reasons.len(), 2);

        for i in 0..4 {
            f.recorder
                .record_failure(&JobFailed {
                    job_id: format!("f{i}"),
                    identity: JobIdentity::new("redis", "default", "X").expect("identity"),
                    exception: "boom".to_string(),
                    failed_at: f.clock.now(),
                    hostname: None,
                })
                .await
                .expect("fail");
        }
        complete(&f, "ok", 100.0).await;
        f.aggregator
            .aggregate_queue("redis", "default")
            .await
            .expect("aggregate");

        // 80% failures caps at 40 points; 500 pending at 1/min is a critical backlog.
        let health = f.scorer.score_queue("redis", "default").await.expect("score");
        assert_eq!(health.score, 20);
        assert_eq!(health.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn duration_spike_against_baseline_costs_points() {
        let f = fixture();
        for i in 0..20 {
            complete(&f, &format!("base-{i}"), 100.0).await;
        }
        f.baselines
            .calculate_for_queue("redis", "default")
            .await
            .expect("baseline");

        f.clock.advance_secs(120);
        for i in 0..20 {
            complete(&f, &format!("slow-{i}"), 400.0).await;
        }
        f.aggregator
            .aggregate_queue("redis", "default")
            .await
            .expect("aggregate");

        let health = f.scorer.score_queue("redis", "default").await.expect("score");
        assert_eq!(health.score, 85);
        assert!(health.reasons[0].contains("deviates from baseline"));
    }
}
