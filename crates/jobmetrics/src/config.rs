//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `JOBMETRICS_KEY_PREFIX`: prefix for every stored key (default: `jobmetrics:`)
//! - `JOBMETRICS_RAW_TTL_SECS`: retention of in-flight markers and sample series (default: 3600)
//! - `JOBMETRICS_AGGREGATED_TTL_SECS`: retention of aggregates and discovery markers (default: 604800)
//! - `JOBMETRICS_BASELINE_TTL_SECS`: retention of baselines (default: 2592000)
//! - `JOBMETRICS_MAX_SAMPLES`: entries kept per sample series (default: 1000)
//! - `JOBMETRICS_EXCEPTION_MAX_LEN`: characters kept of a failure message (default: 1000)
//! - `JOBMETRICS_BASELINE_DECAY`: weight of the previous baseline when blending (default: 0.1)
//! - `JOBMETRICS_BASELINE_TARGET_SAMPLES`: samples needed for full confidence (default: 200)
//! - `JOBMETRICS_BASELINE_SAMPLE_LIMIT`: newest samples read per identity (default: 1000)
//! - `JOBMETRICS_BASELINE_DEVIATION_THRESHOLD`: relative deviation flagged as significant (default: 2.0)
//! - `JOBMETRICS_BASELINE_CONFIDENCE_HALF_LIFE_SECS`: idle time that halves confidence (default: 86400)
//! - `JOBMETRICS_WORKER_STALE_SECS`: heartbeat silence before a worker is crashed (default: 60)
//! - `JOBMETRICS_WORKER_TTL_SECS`: retention of heartbeat records (default: 3600)
//! - `JOBMETRICS_AGGREGATION_INTERVAL_MS`: queue aggregation sweep interval (default: 60000)
//! - `JOBMETRICS_BASELINE_TICK_MS`: how often the baseline sweep checks for due queues (default: 60000)
//! - `JOBMETRICS_STALE_CHECK_INTERVAL_MS`: stale worker sweep interval (default: 30000)
//! - `JOBMETRICS_CLEANUP_INTERVAL_MS`: age-based cleanup sweep interval (default: 3600000)

use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result};

pub const DEFAULT_KEY_PREFIX: &str = "jobmetrics:";

/// Retention tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    /// In-flight markers and sample series.
    pub raw_ttl: Duration,
    /// Job and queue aggregates, queue history and discovery markers.
    pub aggregated_ttl: Duration,
    pub baseline_ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_ttl: Duration::from_secs(60 * 60),
            aggregated_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            baseline_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub max_samples: usize,
    pub exception_max_len: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_samples: 1000,
            exception_max_len: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineConfig {
    pub decay: f64,
    pub target_samples: u64,
    pub sample_limit: usize,
    pub deviation_threshold: f64,
    pub confidence_half_life: Duration,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            decay: 0.1,
            target_samples: 200,
            sample_limit: 1000,
            deviation_threshold: 2.0,
            confidence_half_life: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub stale_after: Duration,
    pub heartbeat_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            heartbeat_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Intervals of the background sweeps.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub aggregation_interval: Duration,
    pub baseline_tick: Duration,
    pub stale_check_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            aggregation_interval: Duration::from_secs(60),
            baseline_tick: Duration::from_secs(60),
            stale_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub key_prefix: String,
    pub retention: RetentionConfig,
    pub recorder: RecorderConfig,
    pub baseline: BaselineConfig,
    pub worker: WorkerConfig,
    pub sweeps: SweepConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention: RetentionConfig::default(),
            recorder: RecorderConfig::default(),
            baseline: BaselineConfig::default(),
            worker: WorkerConfig::default(),
            sweeps: SweepConfig::default(),
        }
    }
}

impl MetricsConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_current_env()
    }

    /// Read the process environment without touching `.env`.
    pub fn from_current_env() -> Result<Self> {
        let defaults = Self::default();

        let key_prefix =
            env::var("JOBMETRICS_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());

        let retention = RetentionConfig {
            raw_ttl: secs_var("JOBMETRICS_RAW_TTL_SECS", defaults.retention.raw_ttl)?,
            aggregated_ttl: secs_var(
                "JOBMETRICS_AGGREGATED_TTL_SECS",
                defaults.retention.aggregated_ttl,
            )?,
            baseline_ttl: secs_var(
                "JOBMETRICS_BASELINE_TTL_SECS",
                defaults.retention.baseline_ttl,
            )?,
        };

        let recorder = RecorderConfig {
            max_samples: parse_var("JOBMETRICS_MAX_SAMPLES", defaults.recorder.max_samples)?,
            exception_max_len: parse_var(
                "JOBMETRICS_EXCEPTION_MAX_LEN",
                defaults.recorder.exception_max_len,
            )?,
        };

        let baseline = BaselineConfig {
            decay: parse_var("JOBMETRICS_BASELINE_DECAY", defaults.baseline.decay)?,
            target_samples: parse_var(
                "JOBMETRICS_BASELINE_TARGET_SAMPLES",
                defaults.baseline.target_samples,
            )?,
            sample_limit: parse_var(
                "JOBMETRICS_BASELINE_SAMPLE_LIMIT",
                defaults.baseline.sample_limit,
            )?,
            deviation_threshold: parse_var(
                "JOBMETRICS_BASELINE_DEVIATION_THRESHOLD",
                defaults.baseline.deviation_threshold,
            )?,
            confidence_half_life: secs_var(
                "JOBMETRICS_BASELINE_CONFIDENCE_HALF_LIFE_SECS",
                defaults.baseline.confidence_half_life,
            )?,
        };
        if !(0.0..=1.0).contains(&baseline.decay) {
            anyhow::bail!(
                "JOBMETRICS_BASELINE_DECAY must be within [0, 1] (got {})",
                baseline.decay
            );
        }

        let worker = WorkerConfig {
            stale_after: secs_var("JOBMETRICS_WORKER_STALE_SECS", defaults.worker.stale_after)?,
            heartbeat_ttl: secs_var("JOBMETRICS_WORKER_TTL_SECS", defaults.worker.heartbeat_ttl)?,
        };

        let sweeps = SweepConfig {
            aggregation_interval: millis_var(
                "JOBMETRICS_AGGREGATION_INTERVAL_MS",
                defaults.sweeps.aggregation_interval,
            )?,
            baseline_tick: millis_var(
                "JOBMETRICS_BASELINE_TICK_MS",
                defaults.sweeps.baseline_tick,
            )?,
            stale_check_interval: millis_var(
                "JOBMETRICS_STALE_CHECK_INTERVAL_MS",
                defaults.sweeps.stale_check_interval,
            )?,
            cleanup_interval: millis_var(
                "JOBMETRICS_CLEANUP_INTERVAL_MS",
                defaults.sweeps.cleanup_interval,
            )?,
        };

        Ok(Self {
            key_prefix,
            retention,
            recorder,
            baseline,
            worker,
            sweeps,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name} value {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}
