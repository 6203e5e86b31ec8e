//! CLI smoke check that replays a synthetic workload through the metrics
//! pipeline and prints what it measured.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use jobmetrics::{MetricsConfig, MetricsService, QueueDepth, StaticQueueInspector};
use jobmetrics_backend_memory::MemoryStore;
use jobmetrics_core::{
    Clock, JobCompleted, JobEvent, JobFailed, JobIdentity, JobStarted, ManualClock, QueueKey,
    WorkerId, WorkerState, WorkerUpdate,
};
use jobmetrics_observability_setup::ObservabilityOptions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "jobmetrics-smoke",
    about = "Replay a synthetic workload through the metrics pipeline."
)]
struct SmokeArgs {
    #[arg(long, default_value = "redis")]
    connection: String,

    #[arg(long, default_value = "default")]
    queue: String,

    /// Job classes to spread the workload over.
    #[arg(long, value_delimiter = ',', default_value = "SendEmail,ResizeImage")]
    job_classes: Vec<String>,

    #[arg(long, default_value_t = 200)]
    jobs: usize,

    /// Simulated arrivals per minute.
    #[arg(long, default_value_t = 60)]
    jobs_per_minute: u32,

    /// Mean duration of the first job class; later classes are slower.
    #[arg(long, default_value_t = 100.0)]
    duration_ms: f64,

    /// Fail every Nth job. Zero disables failures.
    #[arg(long, default_value_t = 20)]
    failure_every: usize,

    #[arg(long, default_value_t = 4)]
    workers: u32,

    /// Pending jobs reported by the queue when scoring health.
    #[arg(long, default_value_t = 0)]
    pending: u64,

    #[arg(long, default_value_t = 7)]
    seed: u64,
}

struct Replay {
    service: MetricsService,
    clock: ManualClock,
    rng: StdRng,
}

impl Replay {
    fn worker_update(
        &self,
        args: &SmokeArgs,
        worker: u32,
        state: WorkerState,
        job: Option<(&str, &str)>,
    ) -> Result<WorkerUpdate> {
        Ok(WorkerUpdate {
            worker_id: WorkerId::derive("smoke-host", 10_000 + worker, Some("smoke"))?,
            connection: args.connection.clone(),
            queue: args.queue.clone(),
            state,
            current_job_id: job.map(|(id, _)| id.to_string()),
            current_job_class: job.map(|(_, class)| class.to_string()),
            pid: 10_000 + worker,
            hostname: "smoke-host".to_string(),
            memory_usage_mb: 64.0 + f64::from(worker),
            cpu_usage_percent: 10.0,
        })
    }

    async fn run(&mut self, args: &SmokeArgs) -> Result<(usize, usize)> {
        let step = ChronoDuration::milliseconds(60_000 / i64::from(args.jobs_per_minute.max(1)));
        let (mut completed, mut failed) = (0, 0);

        for n in 0..args.jobs {
            let class_index = n % args.job_classes.len();
            let identity = JobIdentity::new(
                args.connection.as_str(),
                args.queue.as_str(),
                args.job_classes[class_index].as_str(),
            )?;
            let job_id = Uuid::new_v4().to_string();
            let worker = u32::try_from(n).unwrap_or(0) % args.workers.max(1);

            self.service
                .ingest(JobEvent::Started(JobStarted {
                    job_id: job_id.clone(),
                    identity: identity.clone(),
                    started_at: self.clock.now(),
                }))
                .await;
            self.service
                .workers
                .record_heartbeat(&self.worker_update(
                    args,
                    worker,
                    WorkerState::Busy,
                    Some((job_id.as_str(), identity.job_class.as_str())),
                )?)
                .await?;

            let scale = 1.0 + class_index as f64;
            let duration_ms = args.duration_ms * scale * self.rng.gen_range(0.8..1.2);
            self.clock
                .advance(ChronoDuration::milliseconds(duration_ms as i64));

            let fails = args.failure_every > 0 && (n + 1) % args.failure_every == 0;
            let event = if fails {
                failed += 1;
                JobEvent::Failed(JobFailed {
                    job_id,
                    identity,
                    exception: "RuntimeError: simulated failure".to_string(),
                    failed_at: self.clock.now(),
                    hostname: Some("smoke-host".to_string()),
                })
            } else {
                completed += 1;
                JobEvent::Completed(JobCompleted {
                    job_id,
                    identity,
                    duration_ms,
                    memory_mb: 20.0 * scale * self.rng.gen_range(0.9..1.1),
                    cpu_time_ms: duration_ms * 0.6,
                    completed_at: self.clock.now(),
                    hostname: Some("smoke-host".to_string()),
                })
            };
            self.service.ingest(event).await;
            self.service
                .workers
                .record_heartbeat(&self.worker_update(args, worker, WorkerState::Idle, None)?)
                .await?;

            self.clock.advance(step);
        }
        Ok((completed, failed))
    }
}

async fn run_smoke(args: SmokeArgs) -> Result<()> {
    if args.job_classes.is_empty() {
        bail!("at least one job class is required");
    }

    let clock = ManualClock::new(chrono::Utc::now());
    let inspector = StaticQueueInspector::new();
    inspector.set(
        QueueKey::new(args.connection.as_str(), args.queue.as_str())?,
        QueueDepth {
            pending: args.pending,
            ..QueueDepth::default()
        },
    );
    let service = MetricsService::from_config(
        Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))),
        Arc::new(clock.clone()),
        Arc::new(inspector),
        MetricsConfig::default(),
    );

    let mut replay = Replay {
        service: service.clone(),
        clock: clock.clone(),
        rng: StdRng::seed_from_u64(args.seed),
    };
    let (completed, failed) = replay.run(&args).await?;
    info!(completed, failed, "workload replayed");

    let aggregate = service
        .aggregator
        .aggregate_queue(&args.connection, &args.queue)
        .await?;
    let baseline = service
        .baselines
        .calculate_for_queue(&args.connection, &args.queue)
        .await?;
    let health = service
        .health
        .score_queue(&args.connection, &args.queue)
        .await?;
    let workers = service
        .workers
        .get_active_workers(Some(&args.connection), Some(&args.queue))
        .await?;

    let queues: Vec<String> = service
        .discovery
        .list_queues()
        .await?
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut statistics = Vec::new();
    for identity in service.discovery.list_jobs().await? {
        if let Some(stats) = service.recorder.get_job_statistics(&identity).await? {
            statistics.push(stats);
        }
    }

    let processed: i64 = statistics.iter().map(|s| s.total_processed).sum();
    let failures: i64 = statistics.iter().map(|s| s.total_failed).sum();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "queues": queues,
            "queue_aggregate": aggregate,
            "baseline": baseline,
            "health": health,
            "active_workers": workers.len(),
            "jobs": statistics,
        }))?
    );

    if processed != completed as i64 || failures != failed as i64 {
        bail!(
            "recorded {processed} completions and {failures} failures, replayed {completed} and {failed}"
        );
    }
    Ok(())
}

pub fn main() {
    let args = SmokeArgs::parse();
    jobmetrics_observability_setup::init(ObservabilityOptions::default());
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = match runtime.block_on(run_smoke(args)) {
        Ok(()) => 0,
        Err(err) => {
            println!("Smoke run failed: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
