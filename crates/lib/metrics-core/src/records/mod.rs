//! Stored record shapes and the pure logic that evolves them.
//!
//! Records persisted as hashes expose `to_fields` and `from_hash`; the
//! engine never reads raw hash maps past this module.

mod aggregate;
mod baseline;
mod fields;
mod heartbeat;
mod queue;

pub use self::aggregate::{InFlightJob, JobAggregate};
pub use self::baseline::{
    BaselineDeviation, BaselineEstimate, BaselineObservation, DeviationMetric,
    recalculation_interval,
};
pub use self::heartbeat::{WorkerHeartbeat, WorkerState, WorkerUpdate};
pub use self::queue::{QueueAggregate, TrendDirection};
