//! Key-value store capability used by every metrics component.
//!
//! The store exposes strings, hashes and sorted sets with per-key expiry.
//! Reads are individual calls. Writes go through [`Batch`], which a store must
//! apply all-or-nothing, or through an [`AtomicScript`] when the write depends
//! on what is currently stored.

mod batch;
mod script;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use jobmetrics_backends_core::{BackendError, BackendResult};

pub use self::batch::{Batch, Command, Reply};
pub use self::script::{AtomicScript, ReadView};

/// A sorted-set member with its score.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Backend capability for metric persistence.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Read every field of a hash. Missing keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BackendResult<Vec<ScoredMember>>;

    /// Up to `limit` members with the highest scores, highest first.
    async fn sorted_newest(&self, key: &str, limit: usize) -> BackendResult<Vec<ScoredMember>>;

    /// Number of members in a sorted set.
    async fn sorted_len(&self, key: &str) -> BackendResult<usize>;

    /// Live keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>>;

    /// Remaining time to live, `None` for missing or persistent keys.
    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>>;

    /// Apply a batch atomically; returns one reply per command.
    async fn execute(&self, batch: Batch) -> BackendResult<Vec<Reply>>;

    /// Plan and apply a read-modify-write without interleaving other writers.
    async fn run_script(&self, script: &dyn AtomicScript) -> BackendResult<Vec<Reply>>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn KeyValueStore>;

#[async_trait::async_trait]
impl<T> KeyValueStore for Arc<T>
where
    T: KeyValueStore + ?Sized,
{
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        (**self).get(key).await
    }

    async fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        (**self).hash_get_all(key).await
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BackendResult<Vec<ScoredMember>> {
        (**self).sorted_range_by_score(key, min, max).await
    }

    async fn sorted_newest(&self, key: &str, limit: usize) -> BackendResult<Vec<ScoredMember>> {
        (**self).sorted_newest(key, limit).await
    }

    async fn sorted_len(&self, key: &str) -> BackendResult<usize> {
        (**self).sorted_len(key).await
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        (**self).scan_keys(pattern).await
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        (**self).ttl(key).await
    }

    async fn execute(&self, batch: Batch) -> BackendResult<Vec<Reply>> {
        (**self).execute(batch).await
    }

    async fn run_script(&self, script: &dyn AtomicScript) -> BackendResult<Vec<Reply>> {
        (**self).run_script(script).await
    }
}
