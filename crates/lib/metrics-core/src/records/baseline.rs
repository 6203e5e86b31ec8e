//! Decayed per-job cost baselines.
//!
//! A baseline is refreshed from a window of recent samples. The new window's
//! means are blended with the stored estimate:
//!
//! ```text
//! updated = decay * previous + (1 - decay) * observed
//! ```
//!
//! Confidence depends only on how many samples the latest window held, so
//! noisy but plentiful data still reports high confidence.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{FieldWriter, Fields};
use crate::RecordError;
use crate::time::seconds_between;

/// Minimum window size before a baseline may drive capacity decisions.
pub const MIN_RELIABLE_SAMPLES: u64 = 50;
/// Minimum confidence before a baseline may drive capacity decisions.
pub const MIN_RELIABLE_CONFIDENCE: f64 = 0.7;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Means observed over one sample window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineObservation {
    pub avg_duration_ms: f64,
    pub memory_mb_per_job: f64,
    pub cpu_percent_per_job: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEstimate {
    pub cpu_percent_per_job: f64,
    pub memory_mb_per_job: f64,
    pub avg_duration_ms: f64,
    pub sample_count: u64,
    pub confidence_score: f64,
    pub calculated_at: DateTime<Utc>,
}

impl BaselineEstimate {
    const CPU: &'static str = "cpu_percent_per_job";
    const MEMORY: &'static str = "memory_mb_per_job";
    const DURATION: &'static str = "avg_duration_ms";
    const SAMPLES: &'static str = "sample_count";
    const CONFIDENCE: &'static str = "confidence_score";
    const CALCULATED_AT: &'static str = "calculated_at";

    /// Fold a new observation into `previous`. Without a previous estimate
    /// the observation is taken as-is.
    pub fn blend(
        previous: Option<&BaselineEstimate>,
        observed: &BaselineObservation,
        decay: f64,
        target_samples: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let decay = decay.clamp(0.0, 1.0);
        let mix = |prior: f64, fresh: f64| decay * prior + (1.0 - decay) * fresh;
        let (cpu, memory, duration) = match previous {
            Some(prior) => (
                mix(prior.cpu_percent_per_job, observed.cpu_percent_per_job),
                mix(prior.memory_mb_per_job, observed.memory_mb_per_job),
                mix(prior.avg_duration_ms, observed.avg_duration_ms),
            ),
            None => (
                observed.cpu_percent_per_job,
                observed.memory_mb_per_job,
                observed.avg_duration_ms,
            ),
        };

        Self {
            cpu_percent_per_job: cpu,
            memory_mb_per_job: memory,
            avg_duration_ms: duration,
            sample_count: observed.sample_count,
            confidence_score: Self::confidence_for(observed.sample_count, target_samples),
            calculated_at: now,
        }
    }

    /// `min(1, samples / target)`.
    pub fn confidence_for(sample_count: u64, target_samples: u64) -> f64 {
        if target_samples == 0 {
            return 1.0;
        }
        (sample_count as f64 / target_samples as f64).min(1.0)
    }

    pub fn is_reliable(&self) -> bool {
        self.sample_count >= MIN_RELIABLE_SAMPLES
            && self.confidence_score >= MIN_RELIABLE_CONFIDENCE
    }

    /// [`is_reliable`](Self::is_reliable) with confidence aged to `now`, so
    /// an estimate for a queue that went quiet stops being trusted.
    pub fn is_reliable_at(&self, now: DateTime<Utc>, half_life: Duration) -> bool {
        self.sample_count >= MIN_RELIABLE_SAMPLES
            && self.aged_confidence(now, half_life) >= MIN_RELIABLE_CONFIDENCE
    }

    /// Confidence discounted by how long ago the estimate was refreshed,
    /// halving once per `half_life`.
    pub fn aged_confidence(&self, now: DateTime<Utc>, half_life: Duration) -> f64 {
        let half_life_secs = half_life.as_secs_f64();
        if half_life_secs <= 0.0 {
            return self.confidence_score;
        }
        let age = seconds_between(self.calculated_at, now);
        self.confidence_score * 0.5f64.powf(age / half_life_secs)
    }

    /// Jobs per hour that fit in the given headroom. Zero when any divisor
    /// is not positive.
    pub fn estimate_capacity(&self, available_cpu_percent: f64, available_memory_mb: f64) -> u64 {
        if self.cpu_percent_per_job <= 0.0
            || self.memory_mb_per_job <= 0.0
            || self.avg_duration_ms <= 0.0
        {
            return 0;
        }
        let by_cpu = available_cpu_percent / self.cpu_percent_per_job;
        let by_memory = available_memory_mb / self.memory_mb_per_job;
        let parallel = by_cpu.min(by_memory).floor();
        if !parallel.is_finite() || parallel <= 0.0 {
            return 0;
        }
        (parallel * MILLIS_PER_HOUR / self.avg_duration_ms).floor() as u64
    }

    /// Compare an observed value against this baseline. `None` when the
    /// baseline value for `metric` is not positive.
    pub fn deviation(
        &self,
        metric: DeviationMetric,
        observed: f64,
        threshold: f64,
    ) -> Option<BaselineDeviation> {
        let baseline = match metric {
            DeviationMetric::Duration => self.avg_duration_ms,
            DeviationMetric::Memory => self.memory_mb_per_job,
            DeviationMetric::Cpu => self.cpu_percent_per_job,
        };
        if baseline <= 0.0 || !observed.is_finite() {
            return None;
        }
        let ratio = (observed - baseline).abs() / baseline;
        Some(BaselineDeviation {
            metric,
            observed,
            baseline,
            ratio,
            significant: ratio >= threshold,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        FieldWriter::default()
            .put(Self::CPU, self.cpu_percent_per_job)
            .put(Self::MEMORY, self.memory_mb_per_job)
            .put(Self::DURATION, self.avg_duration_ms)
            .put(Self::SAMPLES, self.sample_count)
            .put(Self::CONFIDENCE, self.confidence_score)
            .put_time(Self::CALCULATED_AT, self.calculated_at)
            .finish()
    }

    pub fn from_hash(map: &HashMap<String, String>) -> Result<Option<Self>, RecordError> {
        if map.is_empty() {
            return Ok(None);
        }
        let fields = Fields::new(map);
        Ok(Some(Self {
            cpu_percent_per_job: fields.required(Self::CPU)?,
            memory_mb_per_job: fields.required(Self::MEMORY)?,
            avg_duration_ms: fields.required(Self::DURATION)?,
            sample_count: fields.parse_or(Self::SAMPLES, 0)?,
            confidence_score: fields.parse_or(Self::CONFIDENCE, 0.0)?,
            calculated_at: fields.required_time(Self::CALCULATED_AT)?,
        }))
    }
}

/// Which baseline value a deviation check compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationMetric {
    Duration,
    Memory,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineDeviation {
    pub metric: DeviationMetric,
    pub observed: f64,
    pub baseline: f64,
    /// `|observed - baseline| / baseline`
    pub ratio: f64,
    pub significant: bool,
}

/// How long to wait before recalculating a baseline with the given
/// confidence.
pub fn recalculation_interval(confidence: f64) -> Duration {
    let minutes = if confidence < 0.5 {
        5
    } else if confidence < 0.7 {
        10
    } else if confidence < 0.9 {
        30
    } else {
        60
    };
    Duration::from_secs(minutes * 60)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    fn estimate(cpu: f64, memory: f64, duration: f64, samples: u64) -> BaselineEstimate {
        BaselineEstimate {
            cpu_percent_per_job: cpu,
            memory_mb_per_job: memory,
            avg_duration_ms: duration,
            sample_count: samples,
            confidence_score: BaselineEstimate::confidence_for(samples, 200),
            calculated_at: at(0),
        }
    }

    fn observation(duration: f64, samples: u64) -> BaselineObservation {
        BaselineObservation {
            avg_duration_ms: duration,
            memory_mb_per_job: 10.0,
            cpu_percent_per_job: 5.0,
            sample_count: samples,
        }
    }

    #[test]
    fn blend_moves_most_of_the_way_to_the_observation() {
        let previous = estimate(5.0, 10.0, 100.0, 100);
        let updated =
            BaselineEstimate::blend(Some(&previous), &observation(200.0, 120), 0.1, 200, at(60));
        assert!((updated.avg_duration_ms - 190.0).abs() < 1e-9);
        assert_eq!(updated.sample_count, 120);
        assert!((updated.confidence_score - 0.6).abs() < 1e-9);
        assert_eq!(updated.calculated_at, at(60));
    }

    #[test]
    fn first_estimate_uses_observation_directly() {
        let first = BaselineEstimate::blend(None, &observation(200.0, 50), 0.1, 200, at(0));
        assert_eq!(first.avg_duration_ms, 200.0);
        assert_eq!(first.confidence_score, 0.25);
        assert!(!first.is_reliable());
    }

    #[test]
    fn reliability_needs_volume_and_confidence() {
        assert!(estimate(1.0, 1.0, 1.0, 140).is_reliable());
        assert!(!estimate(1.0, 1.0, 1.0, 139).is_reliable());

        let mut few = estimate(1.0, 1.0, 1.0, 40);
        few.confidence_score = 1.0;
        assert!(!few.is_reliable());
    }

    #[test]
    fn quiet_estimates_lose_reliability() {
        let baseline = estimate(1.0, 1.0, 1.0, 200);
        let half_life = Duration::from_secs(24 * 60 * 60);
        let fresh = baseline.calculated_at;
        assert!(baseline.is_reliable_at(fresh, half_life));
        assert!(!baseline.is_reliable_at(fresh + chrono::Duration::days(1), half_life));
        assert!(baseline.is_reliable());
    }

    #[test]
    fn capacity_takes_the_tighter_resource() {
        // cpu allows 10 in parallel, memory allows 4
        let baseline = estimate(5.0, 100.0, 1_000.0, 200);
        assert_eq!(baseline.estimate_capacity(50.0, 450.0), 4 * 3_600);
    }

    #[test]
    fn capacity_is_zero_for_degenerate_baselines() {
        assert_eq!(estimate(0.0, 10.0, 100.0, 200).estimate_capacity(50.0, 500.0), 0);
        assert_eq!(estimate(5.0, -1.0, 100.0, 200).estimate_capacity(50.0, 500.0), 0);
        assert_eq!(estimate(5.0, 10.0, 0.0, 200).estimate_capacity(50.0, 500.0), 0);
        assert_eq!(estimate(5.0, 10.0, 100.0, 200).estimate_capacity(1.0, 500.0), 0);
    }

    #[test]
    fn deviation_flags_at_threshold() {
        let baseline = estimate(5.0, 10.0, 100.0, 200);
        let deviation = baseline
            .deviation(DeviationMetric::Duration, 300.0, 2.0)
            .expect("deviation");
        assert_eq!(deviation.ratio, 2.0);
        assert!(deviation.significant);

        let minor = baseline
            .deviation(DeviationMetric::Memory, 15.0, 2.0)
            .expect("deviation");
        assert!(!minor.significant);

        let zero = estimate(0.0, 10.0, 100.0, 200);
        assert_eq!(zero.deviation(DeviationMetric::Cpu, 3.0, 2.0), None);
    }

    #[test]
    fn aged_confidence_halves_per_half_life() {
        let baseline = estimate(5.0, 10.0, 100.0, 200);
        let day = Duration::from_secs(86_400);
        assert_eq!(baseline.aged_confidence(at(0), day), 1.0);
        assert!((baseline.aged_confidence(at(86_400), day) - 0.5).abs() < 1e-9);
        assert!((baseline.aged_confidence(at(2 * 86_400), day) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn cadence_bands() {
        let minutes = |c: f64| recalculation_interval(c).as_secs() / 60;
        assert_eq!(minutes(0.0), 5);
        assert_eq!(minutes(0.49), 5);
        assert_eq!(minutes(0.5), 10);
        assert_eq!(minutes(0.7), 30);
        assert_eq!(minutes(0.9), 60);
        assert_eq!(minutes(1.0), 60);
    }

    #[test]
    fn hash_round_trip() {
        let baseline = estimate(5.5, 10.25, 100.125, 77);
        let map: HashMap<String, String> = baseline.to_fields().into_iter().collect();
        assert_eq!(BaselineEstimate::from_hash(&map), Ok(Some(baseline)));
        assert_eq!(BaselineEstimate::from_hash(&HashMap::new()), Ok(None));
    }

    proptest! {
        #[test]
        fn confidence_is_monotonic_and_capped(a in 0u64..1_000, b in 0u64..1_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let c_low = BaselineEstimate::confidence_for(low, 200);
            let c_high = BaselineEstimate::confidence_for(high, 200);
            prop_assert!(c_low <= c_high);
            prop_assert!(c_high <= 1.0);
            prop_assert!(c_low >= 0.0);
        }
    }
}
