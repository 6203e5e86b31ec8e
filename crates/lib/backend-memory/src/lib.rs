//! In-memory key-value store for tests, local runs and single-process deployments.

mod keyspace;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobmetrics_backends_core::{BackendError, BackendResult, SharedClock, SystemClock};
use jobmetrics_kv_store::{AtomicScript, Batch, KeyValueStore, Reply, ScoredMember};

use self::keyspace::{Keyspace, LockedView, Value};

/// Store that keeps every key in process memory behind a single lock.
///
/// Expiry is lazy: expired keys are invisible to reads and are dropped on the
/// next write that touches the keyspace.
#[derive(Clone)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    clock: SharedClock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            clock,
        }
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.keyspace
            .lock()
            .expect("keyspace poisoned")
            .live_keys(now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key. Useful between test phases.
    pub fn flush(&self) {
        self.keyspace.lock().expect("keyspace poisoned").clear();
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        guard.string(key, now).map(|value| value.cloned())
    }

    async fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        Ok(guard.hash(key, now)?.cloned().unwrap_or_default())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BackendResult<Vec<ScoredMember>> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        let members = guard.sorted_ascending(key, now)?;
        Ok(members
            .into_iter()
            .filter(|entry| entry.score >= min && entry.score <= max)
            .collect())
    }

    async fn sorted_newest(&self, key: &str, limit: usize) -> BackendResult<Vec<ScoredMember>> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        let mut members = guard.sorted_ascending(key, now)?;
        members.reverse();
        members.truncate(limit);
        Ok(members)
    }

    async fn sorted_len(&self, key: &str) -> BackendResult<usize> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        match guard.live(key, now).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members.len()),
            Some(_) => Err(BackendError::WrongType {
                key: key.to_string(),
                expected: "sorted set",
            }),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let matcher = glob::Pattern::new(pattern).map_err(|err| BackendError::Pattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        let mut keys: Vec<String> = guard
            .live_keys(now)
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        let now = self.clock.now();
        let guard = self.keyspace.lock().expect("keyspace poisoned");
        Ok(guard
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .and_then(|expires_at| (expires_at - now).to_std().ok()))
    }

    async fn execute(&self, batch: Batch) -> BackendResult<Vec<Reply>> {
        let now = self.clock.now();
        let mut guard = self.keyspace.lock().expect("keyspace poisoned");
        guard.purge_expired(now);
        guard.apply(batch.into_commands(), now)
    }

    async fn run_script(&self, script: &dyn AtomicScript) -> BackendResult<Vec<Reply>> {
        let now = self.clock.now();
        let mut guard = self.keyspace.lock().expect("keyspace poisoned");
        guard.purge_expired(now);
        let batch = {
            let view = LockedView::new(&guard, now);
            script.plan(&view)?
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        guard.apply(batch.into_commands(), now)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use jobmetrics_backends_core::ManualClock;
    use jobmetrics_kv_store::{Command, ReadView};

    use super::*;

    fn store_at(secs: i64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::at_unix(secs);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let (store, clock) = store_at(1_000);
        let mut batch = Batch::new();
        batch.set_ex("marker", "1", Duration::from_secs(60));
        store.execute(batch).await.expect("execute");

        assert_eq!(store.get("marker").await.expect("get").as_deref(), Some("1"));
        assert_eq!(
            store.ttl("marker").await.expect("ttl"),
            Some(Duration::from_secs(60))
        );

        clock.advance(ChronoDuration::seconds(61));
        assert_eq!(store.get("marker").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn hash_increments_accumulate() {
        let (store, _) = store_at(0);
        let mut batch = Batch::new();
        batch
            .hash_incr("agg", "total", 2)
            .hash_incr("agg", "total", 3)
            .hash_incr_float("agg", "sum", 1.5);
        let replies = store.execute(batch).await.expect("execute");

        assert_eq!(replies[1], Reply::Integer(5));
        let hash = store.hash_get_all("agg").await.expect("hash");
        assert_eq!(hash.get("total").map(String::as_str), Some("5"));
        assert_eq!(hash.get("sum").map(String::as_str), Some("1.5"));
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_effect() {
        let (store, _) = store_at(0);
        let mut setup = Batch::new();
        setup.set("plain", "text");
        store.execute(setup).await.expect("setup");

        let mut batch = Batch::new();
        batch
            .hash_incr("agg", "total", 1)
            .hash_incr("plain", "total", 1);
        let err = store.execute(batch).await.expect_err("wrong type");
        assert!(matches!(err, BackendError::WrongType { .. }));
        assert!(store.hash_get_all("agg").await.expect("hash").is_empty());
    }

    #[tokio::test]
    async fn trim_keeps_highest_scores() {
        let (store, _) = store_at(0);
        let mut batch = Batch::new();
        for idx in 0..5 {
            batch.sorted_add("series", format!("m{idx}"), idx as f64);
        }
        batch.sorted_trim_to_newest("series", 3);
        store.execute(batch).await.expect("execute");

        let newest = store.sorted_newest("series", 10).await.expect("newest");
        let members: Vec<_> = newest.iter().map(|entry| entry.member.as_str()).collect();
        assert_eq!(members, vec!["m4", "m3", "m2"]);

        let ranged = store
            .sorted_range_by_score("series", 3.0, 10.0)
            .await
            .expect("range");
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].member, "m3");
    }

    #[tokio::test]
    async fn scan_keys_matches_glob() {
        let (store, _) = store_at(0);
        let mut batch = Batch::new();
        batch
            .set("p:discovery:queue:a", "1")
            .set("p:discovery:queue:b", "1")
            .set("p:discovery:job:a:x", "1");
        store.execute(batch).await.expect("execute");

        let keys = store
            .scan_keys("p:discovery:queue:*")
            .await
            .expect("scan");
        assert_eq!(keys, vec!["p:discovery:queue:a", "p:discovery:queue:b"]);
    }

    struct CounterScript;

    impl AtomicScript for CounterScript {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn plan(&self, view: &dyn ReadView) -> BackendResult<Batch> {
            let current = view
                .get("counter")?
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(0);
            let mut batch = Batch::new();
            batch.push(Command::Set {
                key: "counter".to_string(),
                value: (current + 1).to_string(),
                ttl: None,
            });
            Ok(batch)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scripts_do_not_lose_updates() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.run_script(&CounterScript).await.expect("script");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(
            store.get("counter").await.expect("get").as_deref(),
            Some("200")
        );
    }
}
