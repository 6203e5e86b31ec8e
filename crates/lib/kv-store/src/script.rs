use std::collections::HashMap;

use jobmetrics_backends_core::BackendResult;

use crate::Batch;

/// Read access handed to an [`AtomicScript`] while the store holds its writers off.
///
/// Expired keys are invisible, exactly as they are to ordinary reads.
pub trait ReadView {
    fn get(&self, key: &str) -> BackendResult<Option<String>>;
    fn hash(&self, key: &str) -> BackendResult<Option<HashMap<String, String>>>;
    fn sorted_score(&self, key: &str, member: &str) -> BackendResult<Option<f64>>;
}

/// A read-modify-write planned against a consistent view of the store.
///
/// `plan` must be pure: it may be invoked more than once by stores that
/// implement atomicity with optimistic retries.
pub trait AtomicScript: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build the writes to apply. An empty batch means "nothing to do".
    fn plan(&self, view: &dyn ReadView) -> BackendResult<Batch>;
}
