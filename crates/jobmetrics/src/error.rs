use jobmetrics_backends_core::BackendError;
use jobmetrics_core::{RecordError, ValidationError};

/// Failure of a metrics operation.
///
/// Absence of data is never an error; queries return `None` or empty
/// collections instead.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("stored record at {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: RecordError,
    },
}

impl MetricsError {
    pub(crate) fn corrupt(key: &str, source: RecordError) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            source,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_transient())
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;
