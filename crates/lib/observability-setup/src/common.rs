/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "jobmetrics=info";

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset. Falls back to [`DEFAULT_FILTER`].
    pub default_filter: Option<String>,
}

impl ObservabilityOptions {
    pub fn filter_directive(&self) -> &str {
        self.default_filter.as_deref().unwrap_or(DEFAULT_FILTER)
    }
}
