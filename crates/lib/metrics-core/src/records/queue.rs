use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{FieldWriter, Fields};
use crate::{QueueKey, RecordError};

/// Point-in-time statistics for one queue, regenerated by every aggregation
/// pass.
///
/// `failure_rate_percent` is computed from lifetime totals while
/// `throughput_per_minute` and `avg_duration_ms` cover the last minute only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAggregate {
    pub queue: QueueKey,
    pub throughput_per_minute: f64,
    pub avg_duration_ms: f64,
    pub failure_rate_percent: f64,
    pub total_processed: i64,
    pub total_failed: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl QueueAggregate {
    const CONNECTION: &'static str = "connection";
    const QUEUE: &'static str = "queue";
    const THROUGHPUT: &'static str = "throughput_per_minute";
    const AVG_DURATION: &'static str = "avg_duration_ms";
    const FAILURE_RATE: &'static str = "failure_rate_percent";
    const TOTAL_PROCESSED: &'static str = "total_processed";
    const TOTAL_FAILED: &'static str = "total_failed";
    const LAST_PROCESSED_AT: &'static str = "last_processed_at";
    const RECORDED_AT: &'static str = "recorded_at";

    /// An all-zero aggregate for a queue with no known jobs.
    pub fn empty(queue: QueueKey, recorded_at: DateTime<Utc>) -> Self {
        Self {
            queue,
            throughput_per_minute: 0.0,
            avg_duration_ms: 0.0,
            failure_rate_percent: 0.0,
            total_processed: 0,
            total_failed: 0,
            last_processed_at: None,
            recorded_at,
        }
    }

    /// Every field, including zero values, so a write fully replaces the
    /// previous aggregate.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut writer = FieldWriter::default();
        writer
            .put(Self::CONNECTION, &self.queue.connection)
            .put(Self::QUEUE, &self.queue.queue)
            .put(Self::THROUGHPUT, self.throughput_per_minute)
            .put(Self::AVG_DURATION, self.avg_duration_ms)
            .put(Self::FAILURE_RATE, self.failure_rate_percent)
            .put(Self::TOTAL_PROCESSED, self.total_processed)
            .put(Self::TOTAL_FAILED, self.total_failed)
            .put_time(Self::RECORDED_AT, self.recorded_at);
        match self.last_processed_at {
            Some(at) => writer.put_time(Self::LAST_PROCESSED_AT, at),
            None => writer.put(Self::LAST_PROCESSED_AT, ""),
        };
        writer.finish()
    }

    pub fn from_hash(map: &HashMap<String, String>) -> Result<Option<Self>, RecordError> {
        if map.is_empty() {
            return Ok(None);
        }
        let fields = Fields::new(map);
        Ok(Some(Self {
            queue: QueueKey {
                connection: fields.required_text(Self::CONNECTION)?,
                queue: fields.required_text(Self::QUEUE)?,
            },
            throughput_per_minute: fields.parse_or(Self::THROUGHPUT, 0.0)?,
            avg_duration_ms: fields.parse_or(Self::AVG_DURATION, 0.0)?,
            failure_rate_percent: fields.parse_or(Self::FAILURE_RATE, 0.0)?,
            total_processed: fields.parse_or(Self::TOTAL_PROCESSED, 0)?,
            total_failed: fields.parse_or(Self::TOTAL_FAILED, 0)?,
            last_processed_at: fields.time(Self::LAST_PROCESSED_AT)?,
            recorded_at: fields.required_time(Self::RECORDED_AT)?,
        }))
    }
}

/// Direction of a queue's throughput over its recent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

impl TrendDirection {
    /// Relative change between the older and newer halves that counts as a
    /// trend.
    pub const THRESHOLD: f64 = 0.10;

    /// Compare the mean of the newer half of `values` (oldest first) with the
    /// older half. Fewer than two points is always stable.
    pub fn from_series(values: &[f64]) -> Self {
        if values.len() < 2 {
            return Self::Stable;
        }
        let (older, newer) = values.split_at(values.len() / 2);
        let older_mean = crate::stats::mean(older);
        let newer_mean = crate::stats::mean(newer);

        if older_mean <= 0.0 {
            return if newer_mean > 0.0 {
                Self::Rising
            } else {
                Self::Stable
            };
        }
        let change = (newer_mean - older_mean) / older_mean;
        if change > Self::THRESHOLD {
            Self::Rising
        } else if change < -Self::THRESHOLD {
            Self::Falling
        } else {
            Self::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Stable => "stable",
        }
    }
}
