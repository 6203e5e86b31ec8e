//! A store wrapper that fails selected operations, for exercising the
//! error paths of sweeps and ingestion.

use std::collections::HashMap;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering},
};
use std::time::Duration;

use jobmetrics_backend_memory::MemoryStore;
use jobmetrics_backends_core::{BackendError, BackendResult};
use jobmetrics_kv_store::{
    AtomicScript, Batch, KeyValueStore, ReadView, Reply, ScoredMember,
};

#[derive(Clone)]
pub struct FaultInjectingStore {
    inner: MemoryStore,
    unavailable: Arc<AtomicBool>,
    poisoned_fragments: Arc<RwLock<Vec<String>>>,
    calls: Arc<AtomicUsize>,
    injected_failures: Arc<AtomicUsize>,
}

impl FaultInjectingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            unavailable: Arc::new(AtomicBool::new(false)),
            poisoned_fragments: Arc::new(RwLock::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every operation that touches a key containing `fragment`.
    pub fn fail_keys_containing(&self, fragment: impl Into<String>) {
        self.poisoned_fragments
            .write()
            .expect("fault list poisoned")
            .push(fragment.into());
    }

    /// Fail every operation until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    pub fn injected_failures(&self) -> usize {
        self.injected_failures.load(AtomicOrdering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, key: &str) -> BackendResult<()> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.check_key(key)
    }

    fn check_key(&self, key: &str) -> BackendResult<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(self.inject(format!("injected outage at {key}")));
        }
        let poisoned = self
            .poisoned_fragments
            .read()
            .expect("fault list poisoned")
            .iter()
            .any(|fragment| key.contains(fragment.as_str()));
        if poisoned {
            return Err(self.inject(format!("injected failure for {key}")));
        }
        Ok(())
    }

    fn check_batch(&self, batch: &Batch) -> BackendResult<()> {
        for command in batch.commands() {
            self.check_key(command.key())?;
        }
        Ok(())
    }

    fn inject(&self, message: String) -> BackendError {
        self.injected_failures.fetch_add(1, AtomicOrdering::SeqCst);
        BackendError::Unavailable(message)
    }
}

/// Runs the wrapped script, then rejects its plan if it writes a faulty key.
struct GuardedScript<'a> {
    store: &'a FaultInjectingStore,
    inner: &'a dyn AtomicScript,
}

impl AtomicScript for GuardedScript<'_> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn plan(&self, view: &dyn ReadView) -> BackendResult<Batch> {
        let batch = self.inner.plan(view)?;
        self.store.check_batch(&batch)?;
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FaultInjectingStore {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        self.check(key)?;
        self.inner.hash_get_all(key).await
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BackendResult<Vec<ScoredMember>> {
        self.check(key)?;
        self.inner.sorted_range_by_score(key, min, max).await
    }

    async fn sorted_newest(&self, key: &str, limit: usize) -> BackendResult<Vec<ScoredMember>> {
        self.check(key)?;
        self.inner.sorted_newest(key, limit).await
    }

    async fn sorted_len(&self, key: &str) -> BackendResult<usize> {
        self.check(key)?;
        self.inner.sorted_len(key).await
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(self.inject(format!("injected outage scanning {pattern}")));
        }
        self.inner.scan_keys(pattern).await
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        self.check(key)?;
        self.inner.ttl(key).await
    }

    async fn execute(&self, batch: Batch) -> BackendResult<Vec<Reply>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.check_batch(&batch)?;
        self.inner.execute(batch).await
    }

    async fn run_script(&self, script: &dyn AtomicScript) -> BackendResult<Vec<Reply>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let guarded = GuardedScript {
            store: self,
            inner: script,
        };
        self.inner.run_script(&guarded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poisoned_batches_leave_no_effect() {
        let store = FaultInjectingStore::new(MemoryStore::new());
        store.fail_keys_containing("broken");

        let mut batch = Batch::new();
        batch.set("jobmetrics:ok", "1").set("jobmetrics:broken", "2");
        let err = store.execute(batch).await.expect_err("injected");
        assert!(err.is_transient());
        assert_eq!(store.inner().get("jobmetrics:ok").await.expect("get"), None);
        assert_eq!(store.injected_failures(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call_until_cleared() {
        let store = FaultInjectingStore::new(MemoryStore::new());
        store.set_unavailable(true);
        assert!(store.get("a").await.is_err());
        assert!(store.scan_keys("*").await.is_err());

        store.set_unavailable(false);
        assert_eq!(store.get("a").await.expect("get"), None);
        assert_eq!(store.calls(), 3);
    }
}
