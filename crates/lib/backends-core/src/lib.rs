//! Core primitives shared by the jobmetrics store backends.

mod clock;

pub use self::clock::{Clock, ManualClock, SharedClock, SystemClock};

/// The common backend error.
///
/// Every store primitive is a single attempt; retrying transient failures is
/// left to the caller.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),

    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("wrong value type at key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("invalid key pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Utility type alias for backend results.
pub type BackendResult<T> = Result<T, BackendError>;
