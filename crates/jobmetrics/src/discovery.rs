//! Discovery markers for known queues and job classes.
//!
//! Every recording call writes the markers for its identity in the same batch
//! as its counters, so any tuple that has data can also be enumerated.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmetrics_backends_core::BackendError;
use jobmetrics_core::time::cutoff;
use jobmetrics_core::{JobIdentity, KeyLayout, QueueKey, SharedClock};
use jobmetrics_kv_store::{Batch, SharedStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MetricsResult;

/// Stored value of a discovery marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMarker {
    pub connection: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_class: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct QueueDiscovery {
    store: SharedStore,
    keys: KeyLayout,
    clock: SharedClock,
    ttl: Duration,
}

impl QueueDiscovery {
    pub fn new(store: SharedStore, keys: KeyLayout, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            store,
            keys,
            clock,
            ttl,
        }
    }

    /// Add queue and job-class markers for `identity` to `batch`.
    pub(crate) fn mark_identity_in(
        &self,
        batch: &mut Batch,
        identity: &JobIdentity,
        at: DateTime<Utc>,
    ) -> MetricsResult<()> {
        self.mark_queue_in(batch, &identity.queue_key(), at)?;
        let marker = DiscoveryMarker {
            connection: identity.connection.clone(),
            queue: identity.queue.clone(),
            job_class: Some(identity.job_class.clone()),
            discovered_at: at,
        };
        batch.set_ex(
            self.keys.job_marker(identity),
            serde_json::to_string(&marker).map_err(BackendError::from)?,
            self.ttl,
        );
        Ok(())
    }

    fn mark_queue_in(
        &self,
        batch: &mut Batch,
        queue: &QueueKey,
        at: DateTime<Utc>,
    ) -> MetricsResult<()> {
        let marker = DiscoveryMarker {
            connection: queue.connection.clone(),
            queue: queue.queue.clone(),
            job_class: None,
            discovered_at: at,
        };
        batch.set_ex(
            self.keys.queue_marker(queue),
            serde_json::to_string(&marker).map_err(BackendError::from)?,
            self.ttl,
        );
        Ok(())
    }

    /// Idempotent: re-marking only refreshes the timestamp and TTL.
    pub async fn mark_discovered(&self, connection: &str, queue: &str) -> MetricsResult<()> {
        let queue = QueueKey::new(connection, queue)?;
        let mut batch = Batch::new();
        self.mark_queue_in(&mut batch, &queue, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    /// Marks the job class and its queue.
    pub async fn mark_job_discovered(
        &self,
        connection: &str,
        queue: &str,
        job_class: &str,
    ) -> MetricsResult<()> {
        let identity = JobIdentity::new(connection, queue, job_class)?;
        let mut batch = Batch::new();
        self.mark_identity_in(&mut batch, &identity, self.clock.now())?;
        self.store.execute(batch).await?;
        Ok(())
    }

    pub async fn list_queues(&self) -> MetricsResult<Vec<QueueKey>> {
        let markers = self.read_markers(&self.keys.queue_marker_pattern()).await?;
        let queues: BTreeSet<QueueKey> = markers
            .into_iter()
            .map(|(_, marker)| QueueKey {
                connection: marker.connection,
                queue: marker.queue,
            })
            .collect();
        Ok(queues.into_iter().collect())
    }

    pub async fn list_jobs(&self) -> MetricsResult<Vec<JobIdentity>> {
        self.jobs_matching(&self.keys.job_marker_pattern()).await
    }

    /// Job classes seen on one queue.
    pub async fn list_jobs_for_queue(&self, queue: &QueueKey) -> MetricsResult<Vec<JobIdentity>> {
        self.jobs_matching(&self.keys.job_marker_pattern_for(queue))
            .await
    }

    async fn jobs_matching(&self, pattern: &str) -> MetricsResult<Vec<JobIdentity>> {
        let markers = self.read_markers(pattern).await?;
        let jobs: BTreeSet<JobIdentity> = markers
            .into_iter()
            .filter_map(|(_, marker)| {
                Some(JobIdentity {
                    connection: marker.connection,
                    queue: marker.queue,
                    job_class: marker.job_class?,
                })
            })
            .collect();
        Ok(jobs.into_iter().collect())
    }

    /// Drop markers whose last refresh is older than `older_than`.
    pub async fn cleanup(&self, older_than: Duration) -> MetricsResult<usize> {
        let threshold = cutoff(self.clock.now(), older_than);
        let mut batch = Batch::new();
        for pattern in [self.keys.queue_marker_pattern(), self.keys.job_marker_pattern()] {
            for (key, marker) in self.read_markers(&pattern).await? {
                if marker.discovered_at < threshold {
                    batch.delete(key);
                }
            }
        }
        let removed = batch.len();
        if removed > 0 {
            self.store.execute(batch).await?;
            debug!(removed, "removed aged discovery markers");
        }
        Ok(removed)
    }

    async fn read_markers(&self, pattern: &str) -> MetricsResult<Vec<(String, DiscoveryMarker)>> {
        let mut markers = Vec::new();
        for key in self.store.scan_keys(pattern).await? {
            // Expired between the scan and the read.
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<DiscoveryMarker>(&raw) {
                Ok(marker) => markers.push((key, marker)),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable discovery marker"),
            }
        }
        Ok(markers)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jobmetrics_backend_memory::MemoryStore;
    use jobmetrics_core::ManualClock;

    use super::*;

    fn discovery(clock: &ManualClock) -> QueueDiscovery {
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        QueueDiscovery::new(
            Arc::new(store),
            KeyLayout::default(),
            Arc::new(clock.clone()),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn marking_is_idempotent() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let discovery = discovery(&clock);
        for _ in 0..5 {
            discovery
                .mark_discovered("redis", "default")
                .await
                .expect("mark");
        }
        let queues = discovery.list_queues().await.expect("list");
        assert_eq!(queues, vec![QueueKey::new("redis", "default").expect("queue")]);
    }

    #[tokio::test]
    async fn job_marking_registers_the_queue_too() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let discovery = discovery(&clock);
        discovery
            .mark_job_discovered("redis", "emails", "SendEmail")
            .await
            .expect("mark");
        discovery
            .mark_job_discovered("redis", "reports", "Build:Report")
            .await
            .expect("mark");

        assert_eq!(discovery.list_queues().await.expect("queues").len(), 2);
        let emails = QueueKey::new("redis", "emails").expect("queue");
        let jobs = discovery.list_jobs_for_queue(&emails).await.expect("jobs");
        assert_eq!(jobs, vec![JobIdentity::new("redis", "emails", "SendEmail").expect("identity")]);
        assert_eq!(discovery.list_jobs().await.expect("jobs").len(), 2);
    }

    #[tokio::test]
    async fn markers_expire_with_their_ttl() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let discovery = discovery(&clock);
        discovery.mark_discovered("redis", "default").await.expect("mark");
        clock.advance_secs(601);
        assert!(discovery.list_queues().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_aged_markers() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let discovery = discovery(&clock);
        discovery.mark_discovered("redis", "old").await.expect("mark");
        clock.advance_secs(300);
        discovery.mark_discovered("redis", "fresh").await.expect("mark");

        let removed = discovery
            .cleanup(Duration::from_secs(120))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        let queues = discovery.list_queues().await.expect("list");
        assert_eq!(queues, vec![QueueKey::new("redis", "fresh").expect("queue")]);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let discovery = discovery(&clock);
        assert!(discovery.mark_discovered("", "default").await.is_err());
    }
}
