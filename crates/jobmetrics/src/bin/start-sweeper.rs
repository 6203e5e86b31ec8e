//! Start Sweeper - runs the background metrics sweeps.
//!
//! Runs queue aggregation, adaptive baseline recalculation, stale worker
//! detection and age-based cleanup until Ctrl+C or SIGTERM.
//!
//! Configuration is via `JOBMETRICS_*` environment variables (see
//! `jobmetrics::config`) and the flags below.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use jobmetrics::{MetricsConfig, MetricsService, StaticQueueInspector};
use jobmetrics_backend_memory::MemoryStore;
use jobmetrics_core::SystemClock;
use jobmetrics_observability_setup::ObservabilityOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "start-sweeper", about = "Run the job metrics background sweeps")]
struct Args {
    /// Emit JSON log lines.
    #[arg(long, env = "JOBMETRICS_LOG_JSON")]
    json_logs: bool,

    /// Seconds to wait for each sweep to stop after shutdown is requested.
    #[arg(long, default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    jobmetrics_observability_setup::init(ObservabilityOptions {
        json: args.json_logs,
        default_filter: Some("jobmetrics=info,start_sweeper=info".to_string()),
    });

    let config = MetricsConfig::from_env()?;
    info!(
        key_prefix = %config.key_prefix,
        raw_ttl_secs = config.retention.raw_ttl.as_secs(),
        aggregated_ttl_secs = config.retention.aggregated_ttl.as_secs(),
        baseline_ttl_secs = config.retention.baseline_ttl.as_secs(),
        aggregation_interval_ms = config.sweeps.aggregation_interval.as_millis(),
        baseline_tick_ms = config.sweeps.baseline_tick.as_millis(),
        stale_check_interval_ms = config.sweeps.stale_check_interval.as_millis(),
        cleanup_interval_ms = config.sweeps.cleanup_interval.as_millis(),
        "starting metrics sweeper"
    );

    let store = Arc::new(MemoryStore::new());
    let service = MetricsService::from_config(
        store,
        Arc::new(SystemClock),
        Arc::new(StaticQueueInspector::new()),
        config,
    );

    let shutdown_token = CancellationToken::new();
    let handles = service.spawn_sweeps(&shutdown_token);

    if let Err(err) = wait_for_shutdown().await {
        error!(error = %err, "shutdown signal listener failed");
    }
    info!("shutdown signal received");
    shutdown_token.cancel();

    let grace = Duration::from_secs(args.shutdown_grace_secs);
    for handle in handles {
        let _ = tokio::time::timeout(grace, handle).await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
