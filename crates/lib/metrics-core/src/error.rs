/// Input rejected at the ingestion or query boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains control characters")]
    ControlCharacters { field: &'static str },

    #[error("{field} must be a finite, non-negative number (got {value})")]
    InvalidMeasurement { field: &'static str, value: f64 },

    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: f64 },
}

/// A stored record could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("record field {field} is missing")]
    Missing { field: &'static str },

    #[error("record field {field} holds unparseable value {value:?}")]
    Corrupt { field: &'static str, value: String },
}
