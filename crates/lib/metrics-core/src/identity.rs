//! Identities keying every stored record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_SEGMENT_LEN: usize = 255;

pub(crate) fn validate_segment(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > MAX_SEGMENT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_SEGMENT_LEN,
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacters { field });
    }
    Ok(())
}

/// A `(connection, queue)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub connection: String,
    pub queue: String,
}

impl QueueKey {
    pub fn new(
        connection: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let key = Self {
            connection: connection.into(),
            queue: queue.into(),
        };
        validate_segment("connection", &key.connection)?;
        validate_segment("queue", &key.queue)?;
        Ok(key)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.queue)
    }
}

/// The `(connection, queue, job class)` triple used for job-level aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    pub connection: String,
    pub queue: String,
    pub job_class: String,
}

impl JobIdentity {
    pub fn new(
        connection: impl Into<String>,
        queue: impl Into<String>,
        job_class: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let identity = Self {
            connection: connection.into(),
            queue: queue.into(),
            job_class: job_class.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Re-check an identity that was built or deserialized without `new`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_segment("connection", &self.connection)?;
        validate_segment("queue", &self.queue)?;
        validate_segment("job_class", &self.job_class)
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            connection: self.connection.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn belongs_to(&self, connection: &str, queue: &str) -> bool {
        self.connection == connection && self.queue == queue
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.connection, self.queue, self.job_class)
    }
}

/// Stable identity of one worker process.
///
/// Two processes on the same host never share an id, and a restarted process
/// gets a new one because its PID changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_segment("worker_id", &value)?;
        Ok(Self(value))
    }

    /// `hostname-pid`, or `supervisor-hostname-pid` under a pooled worker manager.
    pub fn derive(
        hostname: &str,
        pid: u32,
        supervisor: Option<&str>,
    ) -> Result<Self, ValidationError> {
        validate_segment("hostname", hostname)?;
        match supervisor {
            Some(supervisor) => {
                validate_segment("supervisor", supervisor)?;
                Ok(Self(format!("{supervisor}-{hostname}-{pid}")))
            }
            None => Ok(Self(format!("{hostname}-{pid}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
