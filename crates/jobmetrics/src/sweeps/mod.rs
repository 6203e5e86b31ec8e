//! Background sweeps.
//!
//! Each task runs until its shutdown future resolves, sleeping its interval
//! between passes. A pass handles one queue or worker at a time and commits
//! each before moving on, so cancelling between passes loses nothing.

mod aggregation;
mod baseline;
mod cleanup;
mod stale_workers;

pub use self::aggregation::AggregationTask;
pub use self::baseline::{BaselineSweepReport, BaselineTask};
pub use self::cleanup::{CleanupPolicy, CleanupReport, CleanupTask};
pub use self::stale_workers::StaleWorkerTask;
