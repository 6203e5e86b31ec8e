//! Sweeps keep going when a single queue's keys fail.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jobmetrics::sweeps::{AggregationTask, BaselineTask, StaleWorkerTask};
use jobmetrics::{MetricsConfig, MetricsService, StaticQueueInspector};
use jobmetrics_backend_fault_injection::FaultInjectingStore;
use jobmetrics_backend_memory::MemoryStore;
use jobmetrics_core::{
    Clock, JobCompleted, JobIdentity, ManualClock, QueueKey, WorkerId, WorkerState, WorkerUpdate,
};

struct Harness {
    clock: ManualClock,
    store: FaultInjectingStore,
    service: MetricsService,
}

fn harness() -> Harness {
    jobmetrics_observability_setup::init_for_tests();
    let clock = ManualClock::at_unix(1_700_000_000);
    let store = FaultInjectingStore::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let service = MetricsService::from_config(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        Arc::new(StaticQueueInspector::new()),
        MetricsConfig::default(),
    );
    Harness {
        clock,
        store,
        service,
    }
}

async fn complete(h: &Harness, queue: &str, count: usize) -> Result<()> {
    for i in 0..count {
        h.service
            .recorder
            .record_completion(&JobCompleted {
                job_id: format!("{queue}-{i}"),
                identity: JobIdentity::new("redis", queue, "X")?,
                duration_ms: 100.0,
                memory_mb: 10.0,
                cpu_time_ms: 5.0,
                completed_at: h.clock.now(),
                hostname: None,
            })
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn aggregation_skips_a_failing_queue() -> Result<()> {
    let h = harness();
    complete(&h, "default", 3).await?;
    complete(&h, "broken", 3).await?;
    complete(&h, "emails", 3).await?;
    h.store.fail_keys_containing("agg:queue:redis:broken");

    let task = AggregationTask {
        aggregator: h.service.aggregator.clone(),
        interval: Duration::from_secs(60),
    };
    let report = task.sweep_once().await?;
    assert_eq!(report.aggregated, 2);
    assert_eq!(report.failed, vec![QueueKey::new("redis", "broken")?]);

    for queue in ["default", "emails"] {
        let latest = h
            .service
            .aggregator
            .get_latest_queue_metrics("redis", queue)
            .await?;
        assert_eq!(latest.map(|a| a.throughput_per_minute), Some(3.0));
    }
    Ok(())
}

#[tokio::test]
async fn baseline_sweep_retries_failed_queues_next_tick() -> Result<()> {
    let h = harness();
    complete(&h, "default", 10).await?;
    complete(&h, "broken", 10).await?;
    h.store
        .fail_keys_containing("raw:samples:duration:redis:broken");

    let mut task = BaselineTask::new(
        h.service.baselines.clone(),
        h.service.discovery.clone(),
        Arc::new(h.clock.clone()),
        Duration::from_secs(60),
    );
    let report = task.sweep_once().await?;
    assert_eq!(report.recalculated, 1);
    assert_eq!(report.failed, vec![QueueKey::new("redis", "broken")?]);
    assert!(
        task.next_due(&QueueKey::new("redis", "broken")?)
            .is_none()
    );

    let report = task.sweep_once().await?;
    assert_eq!(report.not_due, 1);
    assert_eq!(report.failed.len(), 1);
    assert!(
        h.service
            .baselines
            .get_baseline("redis", "default")
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn stale_sweep_reports_store_outage() -> Result<()> {
    let h = harness();
    h.service
        .workers
        .record_heartbeat(&WorkerUpdate {
            worker_id: WorkerId::derive("host-a", 4242, Some("pool"))?,
            connection: "redis".to_string(),
            queue: "default".to_string(),
            state: WorkerState::Busy,
            current_job_id: Some("job-1".to_string()),
            current_job_class: Some("X".to_string()),
            pid: 4242,
            hostname: "host-a".to_string(),
            memory_usage_mb: 128.0,
            cpu_usage_percent: 40.0,
        })
        .await?;
    let task = StaleWorkerTask {
        tracker: h.service.workers.clone(),
        interval: Duration::from_secs(30),
    };

    h.clock.advance_secs(120);
    h.store.set_unavailable(true);
    let err = task.sweep_once().await.expect_err("outage");
    assert!(err.is_transient());

    h.store.set_unavailable(false);
    assert_eq!(task.sweep_once().await?, 1);
    assert_eq!(task.sweep_once().await?, 0);
    Ok(())
}
