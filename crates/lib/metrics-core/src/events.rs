//! Typed job lifecycle events accepted at the ingestion boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::validate_segment;
use crate::{JobIdentity, ValidationError};

fn validate_measurement(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidMeasurement { field, value });
    }
    Ok(())
}

fn validate_job(job_id: &str, identity: &JobIdentity) -> Result<(), ValidationError> {
    validate_segment("job_id", job_id)?;
    identity.validate()
}

/// A job began executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: String,
    pub identity: JobIdentity,
    pub started_at: DateTime<Utc>,
}

impl JobStarted {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)
    }
}

/// A job finished successfully with its measured cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: String,
    pub identity: JobIdentity,
    pub duration_ms: f64,
    pub memory_mb: f64,
    pub cpu_time_ms: f64,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Alias used by sample transforms, which rewrite completions before they are stored.
pub type CompletedSample = JobCompleted;

impl JobCompleted {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)?;
        validate_measurement("duration_ms", self.duration_ms)?;
        validate_measurement("memory_mb", self.memory_mb)?;
        validate_measurement("cpu_time_ms", self.cpu_time_ms)?;
        if let Some(hostname) = &self.hostname {
            validate_segment("hostname", hostname)?;
        }
        Ok(())
    }
}

/// A job failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: String,
    pub identity: JobIdentity,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl JobFailed {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)?;
        if let Some(hostname) = &self.hostname {
            validate_segment("hostname", hostname)?;
        }
        Ok(())
    }
}

/// A failed attempt was released back to the queue for another try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRetryRequested {
    pub job_id: String,
    pub identity: JobIdentity,
    pub requested_at: DateTime<Utc>,
}

impl JobRetryRequested {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)
    }
}

/// A job exceeded its time limit and was killed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTimedOut {
    pub job_id: String,
    pub identity: JobIdentity,
    pub timed_out_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl JobTimedOut {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)?;
        if let Some(hostname) = &self.hostname {
            validate_segment("hostname", hostname)?;
        }
        Ok(())
    }
}

/// A job raised an exception; it may still be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExceptionOccurred {
    pub job_id: String,
    pub identity: JobIdentity,
    pub exception: String,
    pub occurred_at: DateTime<Utc>,
}

impl JobExceptionOccurred {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job(&self.job_id, &self.identity)
    }
}

/// Any lifecycle event the recorder understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started(JobStarted),
    Completed(JobCompleted),
    Failed(JobFailed),
    RetryRequested(JobRetryRequested),
    TimedOut(JobTimedOut),
    ExceptionOccurred(JobExceptionOccurred),
}

impl JobEvent {
    pub fn identity(&self) -> &JobIdentity {
        match self {
            Self::Started(event) => &event.identity,
            Self::Completed(event) => &event.identity,
            Self::Failed(event) => &event.identity,
            Self::RetryRequested(event) => &event.identity,
            Self::TimedOut(event) => &event.identity,
            Self::ExceptionOccurred(event) => &event.identity,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Started(event) => &event.job_id,
            Self::Completed(event) => &event.job_id,
            Self::Failed(event) => &event.job_id,
            Self::RetryRequested(event) => &event.job_id,
            Self::TimedOut(event) => &event.job_id,
            Self::ExceptionOccurred(event) => &event.job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::RetryRequested(_) => "retry_requested",
            Self::TimedOut(_) => "timed_out",
            Self::ExceptionOccurred(_) => "exception_occurred",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(duration_ms: f64) -> JobCompleted {
        JobCompleted {
            job_id: "job-1".to_string(),
            identity: JobIdentity::new("redis", "default", "SendEmail").expect("identity"),
            duration_ms,
            memory_mb: 12.0,
            cpu_time_ms: 4.0,
            completed_at: Utc::now(),
            hostname: None,
        }
    }

    #[test]
    fn negative_duration_is_rejected() {
        let err = completed(-1.0).validate().expect_err("negative");
        assert_eq!(
            err,
            ValidationError::InvalidMeasurement {
                field: "duration_ms",
                value: -1.0
            }
        );
    }

    #[test]
    fn non_finite_duration_is_rejected() {
        assert!(completed(f64::NAN).validate().is_err());
        assert!(completed(f64::INFINITY).validate().is_err());
        assert!(completed(0.0).validate().is_ok());
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let raw = serde_json::json!({
            "event": "started",
            "job_id": "42",
            "identity": {"connection": "redis", "queue": "default", "job_class": "X"},
            "started_at": "2026-01-01T00:00:00Z"
        });
        let event: JobEvent = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(event.kind(), "started");
        assert_eq!(event.job_id(), "42");
    }
}
