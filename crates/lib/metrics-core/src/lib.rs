//! Shared types for job metrics: identities, stored records, key layout and
//! sample statistics.

mod error;
mod events;
mod identity;
mod keys;
pub mod records;
pub mod stats;
pub mod time;

pub use jobmetrics_backends_core::{Clock, ManualClock, SharedClock, SystemClock};

pub use self::error::{RecordError, ValidationError};
pub use self::events::{
    CompletedSample, JobCompleted, JobEvent, JobExceptionOccurred, JobFailed, JobRetryRequested,
    JobStarted, JobTimedOut,
};
pub use self::identity::{JobIdentity, QueueKey, WorkerId};
pub use self::keys::{KeyLayout, SampleKind, encode_segment};
pub use self::records::{
    BaselineDeviation, BaselineEstimate, BaselineObservation, DeviationMetric, InFlightJob,
    JobAggregate, QueueAggregate, TrendDirection, WorkerHeartbeat, WorkerState, WorkerUpdate,
    recalculation_interval,
};
pub use self::stats::SampleStats;
