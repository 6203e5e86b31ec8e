//! Worker liveness records and their state machine.
//!
//! ```text
//! idle <-> busy          on job start / finish
//! idle | busy -> crashed on a stale heartbeat sweep
//! any -> stopped         on worker shutdown
//! ```
//!
//! Every write charges the time since the previous heartbeat to the bucket of
//! the state the worker was in before the write.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{FieldWriter, Fields};
use crate::time::seconds_between;
use crate::{RecordError, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Crashed,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }

    /// Idle and busy workers are alive; crashed and stopped ones are not.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "crashed" => Ok(Self::Crashed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown worker state {other:?}")),
        }
    }
}

/// What a worker reports on each loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    pub worker_id: WorkerId,
    pub connection: String,
    pub queue: String,
    pub state: WorkerState,
    pub current_job_id: Option<String>,
    pub current_job_class: Option<String>,
    pub pid: u32,
    pub hostname: String,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub connection: String,
    pub queue: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    pub current_job_id: Option<String>,
    pub current_job_class: Option<String>,
    pub idle_time_seconds: f64,
    pub busy_time_seconds: f64,
    pub jobs_processed: u64,
    pub pid: u32,
    pub hostname: String,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub peak_memory_usage_mb: f64,
}

impl WorkerHeartbeat {
    const WORKER_ID: &'static str = "worker_id";
    const CONNECTION: &'static str = "connection";
    const QUEUE: &'static str = "queue";
    const STATE: &'static str = "state";
    const LAST_HEARTBEAT: &'static str = "last_heartbeat";
    const LAST_STATE_CHANGE: &'static str = "last_state_change";
    const CURRENT_JOB_ID: &'static str = "current_job_id";
    const CURRENT_JOB_CLASS: &'static str = "current_job_class";
    const IDLE_TIME: &'static str = "idle_time_seconds";
    const BUSY_TIME: &'static str = "busy_time_seconds";
    const JOBS_PROCESSED: &'static str = "jobs_processed";
    const PID: &'static str = "pid";
    const HOSTNAME: &'static str = "hostname";
    const MEMORY: &'static str = "memory_usage_mb";
    const CPU: &'static str = "cpu_usage_percent";
    const PEAK_MEMORY: &'static str = "peak_memory_usage_mb";

    /// Fold a heartbeat into the previous record, if any.
    pub fn apply(
        previous: Option<&WorkerHeartbeat>,
        update: &WorkerUpdate,
        now: DateTime<Utc>,
    ) -> Self {
        let current_job_id = update.current_job_id.clone().filter(|id| !id.is_empty());
        let mut next = Self {
            worker_id: update.worker_id.clone(),
            connection: update.connection.clone(),
            queue: update.queue.clone(),
            state: update.state,
            last_heartbeat: now,
            last_state_change: now,
            current_job_id,
            current_job_class: update.current_job_class.clone().filter(|c| !c.is_empty()),
            idle_time_seconds: 0.0,
            busy_time_seconds: 0.0,
            jobs_processed: 0,
            pid: update.pid,
            hostname: update.hostname.clone(),
            memory_usage_mb: update.memory_usage_mb,
            cpu_usage_percent: update.cpu_usage_percent,
            peak_memory_usage_mb: update.memory_usage_mb,
        };

        if let Some(previous) = previous {
            next.carry_accounting(previous, now);
            next.peak_memory_usage_mb = previous.peak_memory_usage_mb.max(update.memory_usage_mb);
        }
        next
    }

    /// Explicit state change outside a heartbeat. Resource usage is left
    /// untouched.
    pub fn transition(&self, state: WorkerState, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.last_heartbeat = at;
        if state != WorkerState::Busy {
            next.current_job_id = None;
            next.current_job_class = None;
        }
        next.carry_accounting(self, at);
        next
    }

    /// Time, job count and state-change bookkeeping relative to `previous`.
    /// `self` already holds the new state and job fields.
    fn carry_accounting(&mut self, previous: &WorkerHeartbeat, now: DateTime<Utc>) {
        let elapsed = seconds_between(previous.last_heartbeat, now);
        self.idle_time_seconds = previous.idle_time_seconds;
        self.busy_time_seconds = previous.busy_time_seconds;
        match previous.state {
            WorkerState::Idle => self.idle_time_seconds += elapsed,
            WorkerState::Busy => self.busy_time_seconds += elapsed,
            WorkerState::Crashed | WorkerState::Stopped => {}
        }

        self.jobs_processed = previous.jobs_processed;
        if previous.state == WorkerState::Busy
            && self.state == WorkerState::Idle
            && self.current_job_id.is_none()
        {
            self.jobs_processed += 1;
        }

        self.last_state_change = if previous.state == self.state {
            previous.last_state_change
        } else {
            now
        };
    }

    /// No heartbeat for more than `threshold_seconds`.
    pub fn is_stale(&self, threshold_seconds: f64, now: DateTime<Utc>) -> bool {
        seconds_between(self.last_heartbeat, now) > threshold_seconds
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn serves(&self, connection: Option<&str>, queue: Option<&str>) -> bool {
        connection.is_none_or(|c| c == self.connection) && queue.is_none_or(|q| q == self.queue)
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        FieldWriter::default()
            .put(Self::WORKER_ID, self.worker_id.as_str())
            .put(Self::CONNECTION, &self.connection)
            .put(Self::QUEUE, &self.queue)
            .put(Self::STATE, self.state)
            .put_time(Self::LAST_HEARTBEAT, self.last_heartbeat)
            .put_time(Self::LAST_STATE_CHANGE, self.last_state_change)
            .put_opt(Self::CURRENT_JOB_ID, self.current_job_id.as_deref())
            .put_opt(Self::CURRENT_JOB_CLASS, self.current_job_class.as_deref())
            .put(Self::IDLE_TIME, self.idle_time_seconds)
            .put(Self::BUSY_TIME, self.busy_time_seconds)
            .put(Self::JOBS_PROCESSED, self.jobs_processed)
            .put(Self::PID, self.pid)
            .put(Self::HOSTNAME, &self.hostname)
            .put(Self::MEMORY, self.memory_usage_mb)
            .put(Self::CPU, self.cpu_usage_percent)
            .put(Self::PEAK_MEMORY, self.peak_memory_usage_mb)
            .finish()
    }

    pub fn from_hash(map: &HashMap<String, String>) -> Result<Option<Self>, RecordError> {
        if map.is_empty() {
            return Ok(None);
        }
        let fields = Fields::new(map);
        let worker_id = fields.required_text(Self::WORKER_ID)?;
        Ok(Some(Self {
            worker_id: WorkerId::new(worker_id.clone()).map_err(|_| RecordError::Corrupt {
                field: Self::WORKER_ID,
                value: worker_id,
            })?,
            connection: fields.required_text(Self::CONNECTION)?,
            queue: fields.required_text(Self::QUEUE)?,
            state: fields.required(Self::STATE)?,
            last_heartbeat: fields.required_time(Self::LAST_HEARTBEAT)?,
            last_state_change: fields.required_time(Self::LAST_STATE_CHANGE)?,
            current_job_id: fields.text(Self::CURRENT_JOB_ID).map(str::to_string),
            current_job_class: fields.text(Self::CURRENT_JOB_CLASS).map(str::to_string),
            idle_time_seconds: fields.parse_or(Self::IDLE_TIME, 0.0)?,
            busy_time_seconds: fields.parse_or(Self::BUSY_TIME, 0.0)?,
            jobs_processed: fields.parse_or(Self::JOBS_PROCESSED, 0)?,
            pid: fields.parse_or(Self::PID, 0)?,
            hostname: fields.text(Self::HOSTNAME).unwrap_or_default().to_string(),
            memory_usage_mb: fields.parse_or(Self::MEMORY, 0.0)?,
            cpu_usage_percent: fields.parse_or(Self::CPU, 0.0)?,
            peak_memory_usage_mb: fields.parse_or(Self::PEAK_MEMORY, 0.0)?,
        }))
    }
}
