use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{FieldWriter, Fields};
use crate::{JobIdentity, RecordError};

/// Marker for a job that has started but not yet finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightJob {
    pub job_id: String,
    pub identity: JobIdentity,
    pub started_at: DateTime<Utc>,
}

/// Lifetime counters for one job identity.
///
/// Counters only grow; the whole record disappears through TTL expiry or an
/// explicit cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAggregate {
    pub identity: JobIdentity,
    pub total_processed: i64,
    pub total_failed: i64,
    pub total_retried: i64,
    pub total_timed_out: i64,
    pub total_exceptions: i64,
    pub total_duration_ms_sum: f64,
    pub total_memory_mb_sum: f64,
    pub total_cpu_time_ms_sum: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_exception: Option<String>,
    pub last_hostname: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl JobAggregate {
    pub const CONNECTION: &'static str = "connection";
    pub const QUEUE: &'static str = "queue";
    pub const JOB_CLASS: &'static str = "job_class";
    pub const TOTAL_PROCESSED: &'static str = "total_processed";
    pub const TOTAL_FAILED: &'static str = "total_failed";
    pub const TOTAL_RETRIED: &'static str = "total_retried";
    pub const TOTAL_TIMED_OUT: &'static str = "total_timed_out";
    pub const TOTAL_EXCEPTIONS: &'static str = "total_exceptions";
    pub const DURATION_SUM: &'static str = "total_duration_ms_sum";
    pub const MEMORY_SUM: &'static str = "total_memory_mb_sum";
    pub const CPU_SUM: &'static str = "total_cpu_time_ms_sum";
    pub const LAST_PROCESSED_AT: &'static str = "last_processed_at";
    pub const LAST_FAILED_AT: &'static str = "last_failed_at";
    pub const LAST_EXCEPTION: &'static str = "last_exception";
    pub const LAST_HOSTNAME: &'static str = "last_hostname";
    pub const LAST_ACTIVITY_AT: &'static str = "last_activity_at";

    /// Identity fields written alongside every counter update so cleanup can
    /// recover the identity from the record itself.
    pub fn identity_fields(identity: &JobIdentity, at: DateTime<Utc>) -> Vec<(String, String)> {
        FieldWriter::default()
            .put(Self::CONNECTION, &identity.connection)
            .put(Self::QUEUE, &identity.queue)
            .put(Self::JOB_CLASS, &identity.job_class)
            .put_time(Self::LAST_ACTIVITY_AT, at)
            .finish()
    }

    /// Decode a stored hash. An empty hash means the aggregate does not exist.
    pub fn from_hash(map: &HashMap<String, String>) -> Result<Option<Self>, RecordError> {
        if map.is_empty() {
            return Ok(None);
        }
        let fields = Fields::new(map);
        let identity = JobIdentity {
            connection: fields.required_text(Self::CONNECTION)?,
            queue: fields.required_text(Self::QUEUE)?,
            job_class: fields.required_text(Self::JOB_CLASS)?,
        };

        Ok(Some(Self {
            identity,
            total_processed: fields.parse_or(Self::TOTAL_PROCESSED, 0)?,
            total_failed: fields.parse_or(Self::TOTAL_FAILED, 0)?,
            total_retried: fields.parse_or(Self::TOTAL_RETRIED, 0)?,
            total_timed_out: fields.parse_or(Self::TOTAL_TIMED_OUT, 0)?,
            total_exceptions: fields.parse_or(Self::TOTAL_EXCEPTIONS, 0)?,
            total_duration_ms_sum: fields.parse_or(Self::DURATION_SUM, 0.0)?,
            total_memory_mb_sum: fields.parse_or(Self::MEMORY_SUM, 0.0)?,
            total_cpu_time_ms_sum: fields.parse_or(Self::CPU_SUM, 0.0)?,
            last_processed_at: fields.time(Self::LAST_PROCESSED_AT)?,
            last_failed_at: fields.time(Self::LAST_FAILED_AT)?,
            last_exception: fields.text(Self::LAST_EXCEPTION).map(str::to_string),
            last_hostname: fields.text(Self::LAST_HOSTNAME).map(str::to_string),
            last_seen_at: fields.time(Self::LAST_ACTIVITY_AT)?,
        }))
    }

    pub fn average_duration_ms(&self) -> f64 {
        ratio(self.total_duration_ms_sum, self.total_processed)
    }

    pub fn average_memory_mb(&self) -> f64 {
        ratio(self.total_memory_mb_sum, self.total_processed)
    }

    pub fn average_cpu_time_ms(&self) -> f64 {
        ratio(self.total_cpu_time_ms_sum, self.total_processed)
    }

    /// Share of finished attempts that failed, in percent.
    pub fn failure_rate_percent(&self) -> f64 {
        let attempts = self.total_processed + self.total_failed;
        if attempts <= 0 {
            return 0.0;
        }
        100.0 * self.total_failed as f64 / attempts as f64
    }

    /// Most recent event of any kind recorded against this identity.
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
            .max(self.last_failed_at)
            .max(self.last_seen_at)
    }
}

fn ratio(sum: f64, count: i64) -> f64 {
    if count <= 0 { 0.0 } else { sum / count as f64 }
}
