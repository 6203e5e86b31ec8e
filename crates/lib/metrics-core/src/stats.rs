//! Summary statistics over bounded sample sets.
//!
//! Percentiles use the nearest-rank method on ascending values (no
//! interpolation). Standard deviation is the population form.

use serde::{Deserialize, Serialize};

/// Statistics for one sample series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
}

impl SampleStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let avg = mean(&sorted);
        Self {
            count,
            avg,
            min: sorted[0],
            max: sorted[count - 1],
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
            stddev: population_stddev(&sorted, avg),
        }
    }

    /// Format as a concise string for logging.
    pub fn format(&self) -> String {
        if self.count == 0 {
            return "n=0".to_string();
        }
        format!(
            "n={} avg={:.1} p50={:.1} p95={:.1} p99={:.1} min={:.1} max={:.1} sd={:.1}",
            self.count, self.avg, self.p50, self.p95, self.p99, self.min, self.max, self.stddev
        )
    }
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Value at rank `ceil(p/100 * n)` of the ascending samples.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    nearest_rank(&sorted, p)
}

fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn population_stddev(samples: &[f64], avg: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance = samples
        .iter()
        .map(|value| (value - avg).powi(2))
        .sum::<f64>()
        / samples.len() as f64;
    variance.sqrt()
}
