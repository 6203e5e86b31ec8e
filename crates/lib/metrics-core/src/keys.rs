//! Store key layout.
//!
//! Every key starts with the configured prefix followed by the record kind
//! and the escaped identity segments. Escaping keeps `:` unambiguous as a
//! separator and keeps glob metacharacters out of enumeration patterns.

use std::fmt;

use crate::{JobIdentity, QueueKey, WorkerId};

/// Escape one identity segment for use inside a key.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            '?' => out.push_str("%3F"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            '\\' => out.push_str("%5C"),
            other => out.push(other),
        }
    }
    out
}

/// The three per-identity sample series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Duration,
    Memory,
    Cpu,
}

impl SampleKind {
    pub const ALL: [SampleKind; 3] = [Self::Duration, Self::Memory, Self::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duration => "duration",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("jobmetrics:")
    }
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn queue_suffix(connection: &str, queue: &str) -> String {
        format!("{}:{}", encode_segment(connection), encode_segment(queue))
    }

    fn job_suffix(identity: &JobIdentity) -> String {
        format!(
            "{}:{}",
            Self::queue_suffix(&identity.connection, &identity.queue),
            encode_segment(&identity.job_class)
        )
    }

    pub fn in_flight(&self, job_id: &str) -> String {
        format!("{}raw:inflight:{}", self.prefix, encode_segment(job_id))
    }

    pub fn samples(&self, kind: SampleKind, identity: &JobIdentity) -> String {
        format!(
            "{}raw:samples:{}:{}",
            self.prefix,
            kind.as_str(),
            Self::job_suffix(identity)
        )
    }

    pub fn job_aggregate(&self, identity: &JobIdentity) -> String {
        format!("{}agg:job:{}", self.prefix, Self::job_suffix(identity))
    }

    pub fn job_aggregate_pattern(&self) -> String {
        format!("{}agg:job:*", self.prefix)
    }

    pub fn queue_aggregate(&self, queue: &QueueKey) -> String {
        format!(
            "{}agg:queue:{}",
            self.prefix,
            Self::queue_suffix(&queue.connection, &queue.queue)
        )
    }

    pub fn queue_aggregate_pattern(&self) -> String {
        format!("{}agg:queue:*", self.prefix)
    }

    pub fn queue_history(&self, queue: &QueueKey) -> String {
        format!(
            "{}agg:history:{}",
            self.prefix,
            Self::queue_suffix(&queue.connection, &queue.queue)
        )
    }

    pub fn queue_baseline(&self, queue: &QueueKey) -> String {
        format!(
            "{}baseline:queue:{}",
            self.prefix,
            Self::queue_suffix(&queue.connection, &queue.queue)
        )
    }

    pub fn job_baseline(&self, identity: &JobIdentity) -> String {
        format!("{}baseline:job:{}", self.prefix, Self::job_suffix(identity))
    }

    pub fn baseline_pattern(&self) -> String {
        format!("{}baseline:*", self.prefix)
    }

    pub fn queue_marker(&self, queue: &QueueKey) -> String {
        format!(
            "{}discovery:queue:{}",
            self.prefix,
            Self::queue_suffix(&queue.connection, &queue.queue)
        )
    }

    pub fn queue_marker_pattern(&self) -> String {
        format!("{}discovery:queue:*", self.prefix)
    }

    pub fn job_marker(&self, identity: &JobIdentity) -> String {
        format!("{}discovery:job:{}", self.prefix, Self::job_suffix(identity))
    }

    pub fn job_marker_pattern(&self) -> String {
        format!("{}discovery:job:*", self.prefix)
    }

    /// Job markers under one queue only.
    pub fn job_marker_pattern_for(&self, queue: &QueueKey) -> String {
        format!(
            "{}discovery:job:{}:*",
            self.prefix,
            Self::queue_suffix(&queue.connection, &queue.queue)
        )
    }

    pub fn worker(&self, worker_id: &WorkerId) -> String {
        format!("{}worker:{}", self.prefix, encode_segment(worker_id.as_str()))
    }

    pub fn worker_index(&self) -> String {
        format!("{}workers:index", self.prefix)
    }
}
