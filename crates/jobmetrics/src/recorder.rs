//! Per-identity counters and sample series, written one atomic batch per
//! lifecycle event.

use chrono::{DateTime, Utc};
use jobmetrics_backends_core::BackendError;
use jobmetrics_core::time::{cutoff, to_millis, to_score};
use jobmetrics_core::{
    InFlightJob, JobAggregate, JobCompleted, JobEvent, JobExceptionOccurred, JobFailed,
    JobIdentity, JobRetryRequested, JobStarted, JobTimedOut, KeyLayout, SampleKind, SampleStats,
    SharedClock,
};
use jobmetrics_kv_store::{Batch, SharedStore};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{RecorderConfig, RetentionConfig};
use crate::discovery::QueueDiscovery;
use crate::error::{MetricsError, MetricsResult};
use crate::series;
use crate::transforms::TransformPipeline;

/// Percentile summaries of an identity's sample series plus its lifetime
/// counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatistics {
    pub identity: JobIdentity,
    pub total_processed: i64,
    pub total_failed: i64,
    pub failure_rate_percent: f64,
    pub duration_ms: SampleStats,
    pub memory_mb: SampleStats,
    pub cpu_time_ms: SampleStats,
}

#[derive(Clone)]
pub struct SampleRecorder {
    store: SharedStore,
    keys: KeyLayout,
    clock: SharedClock,
    discovery: QueueDiscovery,
    transforms: TransformPipeline,
    retention: RetentionConfig,
    config: RecorderConfig,
}

impl SampleRecorder {
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        clock: SharedClock,
        discovery: QueueDiscovery,
        retention: RetentionConfig,
        config: RecorderConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            discovery,
            transforms: TransformPipeline::default(),
            retention,
            config,
        }
    }

    pub fn with_transforms(mut self, transforms: TransformPipeline) -> Self {
        self.transforms = transforms;
        self
    }

    pub async fn record(&self, event: &JobEvent) -> MetricsResult<()> {
        match event {
            JobEvent::Started(event) => self.record_start(event).await,
            JobEvent::Completed(event) => self.record_completion(event).await,
            JobEvent::Failed(event) => self.record_failure(event).await,
            JobEvent::RetryRequested(event) => self.record_retry_requested(event).await,
            JobEvent::TimedOut(event) => self.record_timeout(event).await,
            JobEvent::ExceptionOccurred(event) => self.record_exception(event).await,
        }
    }

    /// Writes the in-flight marker. A repeated start for the same job
    /// overwrites the marker.
    pub async fn record_start(&self, event: &JobStarted) -> MetricsResult<()> {
        event.validate()?;
        let marker = InFlightJob {
            job_id: event.job_id.clone(),
            identity: event.identity.clone(),
            started_at: event.started_at,
        };
        let payload = serde_json::to_string(&marker).map_err(BackendError::from)?;

        let mut batch = Batch::new();
        batch.set_ex(
            self.keys.in_flight(&event.job_id),
            payload,
            self.retention.raw_ttl,
        );
        self.discovery
            .mark_identity_in(&mut batch, &event.identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    /// Counters, sums, the three sample series, the in-flight marker and the
    /// discovery markers change together or not at all.
    pub async fn record_completion(&self, event: &JobCompleted) -> MetricsResult<()> {
        event.validate()?;
        let sample = self.transforms.apply(event.clone());
        sample.validate()?;

        let identity = &sample.identity;
        let aggregate_key = self.keys.job_aggregate(identity);
        let mut batch = Batch::new();
        batch
            .hash_incr(&aggregate_key, JobAggregate::TOTAL_PROCESSED, 1)
            .hash_incr_float(&aggregate_key, JobAggregate::DURATION_SUM, sample.duration_ms)
            .hash_incr_float(&aggregate_key, JobAggregate::MEMORY_SUM, sample.memory_mb)
            .hash_incr_float(&aggregate_key, JobAggregate::CPU_SUM, sample.cpu_time_ms);
        let mut fields = JobAggregate::identity_fields(identity, self.clock.now());
        fields.push((
            JobAggregate::LAST_PROCESSED_AT.to_string(),
            to_millis(sample.completed_at).to_string(),
        ));
        if let Some(hostname) = &sample.hostname {
            fields.push((JobAggregate::LAST_HOSTNAME.to_string(), hostname.clone()));
        }
        batch
            .hash_set(&aggregate_key, fields)
            .expire(&aggregate_key, self.retention.aggregated_ttl);

        let score = to_score(sample.completed_at);
        for (kind, value) in [
            (SampleKind::Duration, sample.duration_ms),
            (SampleKind::Memory, sample.memory_mb),
            (SampleKind::Cpu, sample.cpu_time_ms),
        ] {
            let key = self.keys.samples(kind, identity);
            batch
                .sorted_add(&key, series::encode_member(&sample.job_id, value), score)
                .sorted_trim_to_newest(&key, self.config.max_samples)
                .expire(&key, self.retention.raw_ttl);
        }

        batch.delete(self.keys.in_flight(&sample.job_id));
        self.discovery
            .mark_identity_in(&mut batch, identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    pub async fn record_failure(&self, event: &JobFailed) -> MetricsResult<()> {
        event.validate()?;
        let exception = self.truncate(&event.exception);
        self.record_failed_attempt(
            &event.job_id,
            &event.identity,
            event.failed_at,
            &exception,
            event.hostname.as_deref(),
            false,
        )
        .await
    }

    /// A timeout is a failure that is also counted separately.
    pub async fn record_timeout(&self, event: &JobTimedOut) -> MetricsResult<()> {
        event.validate()?;
        let exception = self.truncate(&format!(
            "timeout: job {} exceeded its time limit",
            event.job_id
        ));
        self.record_failed_attempt(
            &event.job_id,
            &event.identity,
            event.timed_out_at,
            &exception,
            event.hostname.as_deref(),
            true,
        )
        .await
    }

    async fn record_failed_attempt(
        &self,
        job_id: &str,
        identity: &JobIdentity,
        failed_at: DateTime<Utc>,
        exception: &str,
        hostname: Option<&str>,
        timed_out: bool,
    ) -> MetricsResult<()> {
        let aggregate_key = self.keys.job_aggregate(identity);
        let mut batch = Batch::new();
        batch.hash_incr(&aggregate_key, JobAggregate::TOTAL_FAILED, 1);
        if timed_out {
            batch.hash_incr(&aggregate_key, JobAggregate::TOTAL_TIMED_OUT, 1);
        }
        let mut fields = JobAggregate::identity_fields(identity, self.clock.now());
        fields.push((
            JobAggregate::LAST_FAILED_AT.to_string(),
            to_millis(failed_at).to_string(),
        ));
        fields.push((JobAggregate::LAST_EXCEPTION.to_string(), exception.to_string()));
        if let Some(hostname) = hostname {
            fields.push((JobAggregate::LAST_HOSTNAME.to_string(), hostname.to_string()));
        }
        batch
            .hash_set(&aggregate_key, fields)
            .expire(&aggregate_key, self.retention.aggregated_ttl)
            .delete(self.keys.in_flight(job_id));
        self.discovery
            .mark_identity_in(&mut batch, identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    /// The attempt is over but the job goes back on the queue.
    pub async fn record_retry_requested(&self, event: &JobRetryRequested) -> MetricsResult<()> {
        event.validate()?;
        let aggregate_key = self.keys.job_aggregate(&event.identity);
        let mut batch = Batch::new();
        batch
            .hash_incr(&aggregate_key, JobAggregate::TOTAL_RETRIED, 1)
            .hash_set(
                &aggregate_key,
                JobAggregate::identity_fields(&event.identity, self.clock.now()),
            )
            .expire(&aggregate_key, self.retention.aggregated_ttl)
            .delete(self.keys.in_flight(&event.job_id));
        self.discovery
            .mark_identity_in(&mut batch, &event.identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    /// Records the exception without counting a failure; the job may still
    /// be retried or succeed.
    pub async fn record_exception(&self, event: &JobExceptionOccurred) -> MetricsResult<()> {
        event.validate()?;
        let aggregate_key = self.keys.job_aggregate(&event.identity);
        let mut fields = JobAggregate::identity_fields(&event.identity, self.clock.now());
        fields.push((
            JobAggregate::LAST_EXCEPTION.to_string(),
            self.truncate(&event.exception),
        ));

        let mut batch = Batch::new();
        batch
            .hash_incr(&aggregate_key, JobAggregate::TOTAL_EXCEPTIONS, 1)
            .hash_set(&aggregate_key, fields)
            .expire(&aggregate_key, self.retention.aggregated_ttl);
        self.discovery
            .mark_identity_in(&mut batch, &event.identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    fn truncate(&self, exception: &str) -> String {
        exception
            .chars()
            .take(self.config.exception_max_len)
            .collect()
    }

    pub async fn get_metrics(&self, identity: &JobIdentity) -> MetricsResult<Option<JobAggregate>> {
        let key = self.keys.job_aggregate(identity);
        let map = self.store.hash_get_all(&key).await?;
        JobAggregate::from_hash(&map).map_err(|err| MetricsError::corrupt(&key, err))
    }

    pub async fn get_in_flight(&self, job_id: &str) -> MetricsResult<Option<InFlightJob>> {
        let key = self.keys.in_flight(job_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let marker = serde_json::from_str(&raw).map_err(BackendError::from)?;
        Ok(Some(marker))
    }

    /// Newest values first.
    pub async fn get_samples(
        &self,
        kind: SampleKind,
        identity: &JobIdentity,
        limit: usize,
    ) -> MetricsResult<Vec<f64>> {
        series::newest(&*self.store, &self.keys.samples(kind, identity), limit).await
    }

    pub async fn get_duration_samples(
        &self,
        identity: &JobIdentity,
        limit: usize,
    ) -> MetricsResult<Vec<f64>> {
        self.get_samples(SampleKind::Duration, identity, limit).await
    }

    pub async fn get_memory_samples(
        &self,
        identity: &JobIdentity,
        limit: usize,
    ) -> MetricsResult<Vec<f64>> {
        self.get_samples(SampleKind::Memory, identity, limit).await
    }

    pub async fn get_cpu_time_samples(
        &self,
        identity: &JobIdentity,
        limit: usize,
    ) -> MetricsResult<Vec<f64>> {
        self.get_samples(SampleKind::Cpu, identity, limit).await
    }

    /// `None` when the identity has neither counters nor samples.
    pub async fn get_job_statistics(
        &self,
        identity: &JobIdentity,
    ) -> MetricsResult<Option<JobStatistics>> {
        let aggregate = self.get_metrics(identity).await?;
        let limit = self.config.max_samples;
        let durations = self.get_duration_samples(identity, limit).await?;
        let memory = self.get_memory_samples(identity, limit).await?;
        let cpu = self.get_cpu_time_samples(identity, limit).await?;
        if aggregate.is_none() && durations.is_empty() {
            return Ok(None);
        }

        let (total_processed, total_failed, failure_rate_percent) = aggregate
            .as_ref()
            .map(|a| (a.total_processed, a.total_failed, a.failure_rate_percent()))
            .unwrap_or_default();
        Ok(Some(JobStatistics {
            identity: identity.clone(),
            total_processed,
            total_failed,
            failure_rate_percent,
            duration_ms: SampleStats::from_samples(&durations),
            memory_mb: SampleStats::from_samples(&memory),
            cpu_time_ms: SampleStats::from_samples(&cpu),
        }))
    }

    /// Delete job aggregates, and their sample series, with no activity
    /// within `older_than`.
    pub async fn cleanup(&self, older_than: std::time::Duration) -> MetricsResult<usize> {
        let threshold = cutoff(self.clock.now(), older_than);
        let mut removed = 0;
        for key in self.store.scan_keys(&self.keys.job_aggregate_pattern()).await? {
            let map = self.store.hash_get_all(&key).await?;
            let aggregate = match JobAggregate::from_hash(&map) {
                Ok(Some(aggregate)) => aggregate,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable job aggregate");
                    continue;
                }
            };
            if aggregate.last_activity_at().is_some_and(|at| at >= threshold) {
                continue;
            }

            let mut batch = Batch::new();
            batch.delete(&key);
            for kind in SampleKind::ALL {
                batch.delete(self.keys.samples(kind, &aggregate.identity));
            }
            self.store.execute(batch).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "removed aged job aggregates");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use jobmetrics_backend_memory::MemoryStore;
    use jobmetrics_core::{Clock, ManualClock};

    use super::*;

    struct Fixture {
        clock: ManualClock,
        store: MemoryStore,
        recorder: SampleRecorder,
    }

    fn fixture(config: RecorderConfig) -> Fixture {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let shared: SharedStore = Arc::new(store.clone());
        let retention = RetentionConfig::default();
        let discovery = QueueDiscovery::new(
            shared.clone(),
            KeyLayout::default(),
            Arc::new(clock.clone()),
            retention.aggregated_ttl,
        );
        let recorder = SampleRecorder::new(
            shared,
            KeyLayout::default(),
            Arc::new(clock.clone()),
            discovery,
            retention,
            config,
        );
        Fixture {
            clock,
            store,
            recorder,
        }
    }

    fn identity() -> JobIdentity {
        JobIdentity::new("redis", "default", "SendEmail").expect("identity")
    }

    fn completed(job_id: &str, duration_ms: f64, at: DateTime<Utc>) -> JobCompleted {
        JobCompleted {
            job_id: job_id.to_string(),
            identity: identity(),
            duration_ms,
            memory_mb: 10.0,
            cpu_time_ms: 5.0,
            completed_at: at,
            hostname: Some("web-1".to_string()),
        }
    }

    #[tokio::test]
    async fn completion_updates_counters_series_and_clears_in_flight() {
        let f = fixture(RecorderConfig::default());
        let now = f.clock.now();
        f.recorder
            .record_start(&JobStarted {
                job_id: "1".to_string(),
                identity: identity(),
                started_at: now,
            })
            .await
            .expect("start");
        assert!(f.recorder.get_in_flight("1").await.expect("read").is_some());

        f.recorder
            .record_completion(&completed("1", 120.0, now))
            .await
            .expect("complete");

        let metrics = f
            .recorder
            .get_metrics(&identity())
            .await
            .expect("metrics")
            .expect("present");
        assert_eq!(metrics.total_processed, 1);
        assert_eq!(metrics.total_duration_ms_sum, 120.0);
        assert_eq!(metrics.last_processed_at, Some(now));
        assert_eq!(metrics.last_hostname.as_deref(), Some("web-1"));
        assert_eq!(f.recorder.get_in_flight("1").await.expect("read"), None);
        assert_eq!(
            f.recorder
                .get_duration_samples(&identity(), 10)
                .await
                .expect("samples"),
            vec![120.0]
        );
    }

    #[tokio::test]
    async fn series_are_trimmed_to_the_newest_entries() {
        let f = fixture(RecorderConfig {
            max_samples: 3,
            exception_max_len: 1000,
        });
        for i in 0..5 {
            f.clock.advance_secs(1);
            f.recorder
                .record_completion(&completed(&i.to_string(), i as f64, f.clock.now()))
                .await
                .expect("complete");
        }
        let samples = f
            .recorder
            .get_duration_samples(&identity(), 10)
            .await
            .expect("samples");
        assert_eq!(samples, vec![4.0, 3.0, 2.0]);
        let metrics = f.recorder.get_metrics(&identity()).await.expect("metrics");
        assert_eq!(metrics.expect("present").total_processed, 5);
    }

    #[tokio::test]
    async fn failures_truncate_exceptions() {
        let f = fixture(RecorderConfig {
            max_samples: 10,
            exception_max_len: 8,
        });
        f.recorder
            .record_failure(&JobFailed {
                job_id: "9".to_string(),
                identity: identity(),
                exception: "RuntimeError: boom".to_string(),
                failed_at: f.clock.now(),
                hostname: None,
            })
            .await
            .expect("failure");
        let metrics = f
            .recorder
            .get_metrics(&identity())
            .await
            .expect("metrics")
            .expect("present");
        assert_eq!(metrics.total_failed, 1);
        assert_eq!(metrics.total_processed, 0);
        assert_eq!(metrics.last_exception.as_deref(), Some("RuntimeE"));
        assert_eq!(metrics.last_failed_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn timeouts_count_as_failures_and_exceptions_do_not() {
        let f = fixture(RecorderConfig::default());
        let now = f.clock.now();
        f.recorder
            .record_timeout(&JobTimedOut {
                job_id: "1".to_string(),
                identity: identity(),
                timed_out_at: now,
                hostname: None,
            })
            .await
            .expect("timeout");
        f.recorder
            .record_exception(&JobExceptionOccurred {
                job_id: "2".to_string(),
                identity: identity(),
                exception: "ValueError".to_string(),
                occurred_at: now,
            })
            .await
            .expect("exception");
        f.recorder
            .record_retry_requested(&JobRetryRequested {
                job_id: "2".to_string(),
                identity: identity(),
                requested_at: now,
            })
            .await
            .expect("retry");

        let metrics = f
            .recorder
            .get_metrics(&identity())
            .await
            .expect("metrics")
            .expect("present");
        assert_eq!(metrics.total_failed, 1);
        assert_eq!(metrics.total_timed_out, 1);
        assert_eq!(metrics.total_exceptions, 1);
        assert_eq!(metrics.total_retried, 1);
        assert_eq!(metrics.last_exception.as_deref(), Some("ValueError"));
    }

    #[tokio::test]
    async fn negative_duration_leaves_no_trace() {
        let f = fixture(RecorderConfig::default());
        let err = f
            .recorder
            .record_completion(&completed("1", -5.0, f.clock.now()))
            .await
            .expect_err("rejected");
        assert!(matches!(err, MetricsError::Validation(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn transforms_run_before_the_write_and_are_revalidated() {
        let f = fixture(RecorderConfig::default());
        let mut pipeline = TransformPipeline::new();
        pipeline.register(0, |mut sample| {
            sample.duration_ms /= 1000.0;
            sample
        });
        let recorder = f.recorder.clone().with_transforms(pipeline);
        recorder
            .record_completion(&completed("1", 2_000.0, f.clock.now()))
            .await
            .expect("complete");
        assert_eq!(
            recorder
                .get_duration_samples(&identity(), 1)
                .await
                .expect("samples"),
            vec![2.0]
        );

        let mut broken = TransformPipeline::new();
        broken.register(0, |mut sample| {
            sample.memory_mb = f64::NAN;
            sample
        });
        let recorder = f.recorder.clone().with_transforms(broken);
        assert!(
            recorder
                .record_completion(&completed("2", 1.0, f.clock.now()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn statistics_summarize_series() {
        let f = fixture(RecorderConfig::default());
        assert_eq!(
            f.recorder.get_job_statistics(&identity()).await.expect("stats"),
            None
        );
        for (i, duration) in [10.0, 20.0, 30.0, 40.0, 50.0].into_iter().enumerate() {
            f.clock.advance_secs(1);
            f.recorder
                .record_completion(&completed(&i.to_string(), duration, f.clock.now()))
                .await
                .expect("complete");
        }
        let stats = f
            .recorder
            .get_job_statistics(&identity())
            .await
            .expect("stats")
            .expect("present");
        assert_eq!(stats.total_processed, 5);
        assert_eq!(stats.duration_ms.p50, 30.0);
        assert_eq!(stats.memory_mb.avg, 10.0);
    }

    #[tokio::test]
    async fn cleanup_removes_idle_aggregates_and_series() {
        let f = fixture(RecorderConfig::default());
        f.recorder
            .record_completion(&completed("1", 10.0, f.clock.now()))
            .await
            .expect("complete");
        f.clock.advance_secs(600);

        let kept = f
            .recorder
            .cleanup(Duration::from_secs(3_600))
            .await
            .expect("cleanup");
        assert_eq!(kept, 0);

        let removed = f
            .recorder
            .cleanup(Duration::from_secs(300))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(f.recorder.get_metrics(&identity()).await.expect("metrics"), None);
        assert!(
            f.recorder
                .get_duration_samples(&identity(), 10)
                .await
                .expect("samples")
                .is_empty()
        );
    }
}
