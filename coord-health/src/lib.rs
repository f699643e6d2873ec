// SPDX-License-Identifier: Apache-2.0

//! Health tracker (spec.md §4.2). A periodic task probes every configured
//! storage with a short-deadline accessor call and writes the result
//! through [`Datastore::upsert_health`]; a cached read answers
//! `is_healthy` from the datastore's consensus view, refreshed at most
//! once per `cache_ttl`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{instrument, warn};

use coord_backend::{BackendClient, Endpoint};
use coord_core::{StorageName, VirtualStorage};
use coord_datastore::Datastore;

/// One configured replica this coordinator probes.
#[derive(Clone, Debug)]
pub struct ProbeTarget {
    pub virtual_storage: VirtualStorage,
    pub storage: StorageName,
    pub endpoint: Endpoint,
}

struct CacheEntry {
    healthy: bool,
    refreshed_at: Instant,
}

pub struct HealthTracker {
    coordinator_id: String,
    datastore: Arc<dyn Datastore>,
    backend: Arc<dyn BackendClient>,
    probe_interval: Duration,
    probe_deadline: Duration,
    healthy_window: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(VirtualStorage, StorageName), CacheEntry>>,
}

impl HealthTracker {
    pub fn new(
        coordinator_id: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        backend: Arc<dyn BackendClient>,
        probe_interval: Duration,
        probe_deadline: Duration,
        healthy_window: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            datastore,
            backend,
            probe_interval,
            probe_deadline,
            healthy_window,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs until `shutdown` fires, probing every target once per
    /// `probe_interval` (with a small jitter) and persisting results.
    /// In-flight probes are allowed to drain under `probe_deadline` before
    /// the loop exits.
    #[instrument(name = "health probe loop", skip(self, targets, shutdown))]
    pub async fn run(&self, targets: Vec<ProbeTarget>, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = coord_rt::interval(self.probe_interval, Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
                tick = futures::StreamExt::next(&mut ticks) => {
                    if tick.is_none() {
                        break;
                    }
                    self.probe_all(&targets).await;
                },
            }
        }
    }

    async fn probe_all(&self, targets: &[ProbeTarget]) {
        let probes = targets.iter().map(|target| self.probe_one(target));
        futures::future::join_all(probes).await;
    }

    #[instrument(skip(self, target), fields(storage = %target.storage))]
    async fn probe_one(&self, target: &ProbeTarget) {
        let result = self.backend.probe(&target.endpoint, self.probe_deadline).await;
        match result {
            Ok(()) => {
                let now = now_unix();
                if let Err(e) = self
                    .datastore
                    .upsert_health(&self.coordinator_id, &target.virtual_storage, &target.storage, now)
                    .await
                {
                    warn!(error = %e, "failed to persist health probe result");
                }
            },
            Err(e) => {
                warn!(error = %e, "probe failed, leaving last-seen timestamp stale");
            },
        }
    }

    /// Cached, consensus-backed liveness read (spec.md §4.2).
    pub async fn is_healthy(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> bool {
        let key = (virtual_storage.clone(), storage.clone());
        if let Some(entry) = self.cache.lock().get(&key) {
            if entry.refreshed_at.elapsed() < self.cache_ttl {
                return entry.healthy;
            }
        }

        let healthy = self
            .datastore
            .consensus_healthy(virtual_storage, storage, self.healthy_window.as_secs() as i64)
            .await
            .unwrap_or(false);

        self.cache.lock().insert(
            key,
            CacheEntry {
                healthy,
                refreshed_at: Instant::now(),
            },
        );
        healthy
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coord_datastore::MemDatastore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        fail_count: AtomicUsize,
    }

    #[async_trait]
    impl BackendClient for FakeBackend {
        async fn probe(&self, _endpoint: &Endpoint, _deadline: Duration) -> Result<(), coord_backend::BackendError> {
            if self.fail_count.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(coord_backend::BackendError::Timeout);
            }
            Ok(())
        }

        async fn replicate_repository(
            &self,
            _: &Endpoint,
            _: &Endpoint,
            _: &coord_core::RepositoryId,
        ) -> Result<(), coord_backend::BackendError> {
            unimplemented!()
        }

        async fn get_snapshot(
            &self,
            _: &Endpoint,
            _: &coord_core::RepositoryId,
        ) -> Result<coord_backend::SnapshotStream, coord_backend::BackendError> {
            unimplemented!()
        }

        async fn create_repository_from_snapshot(
            &self,
            _: &Endpoint,
            _: &coord_core::RepositoryId,
            _: coord_backend::SnapshotStream,
        ) -> Result<(), coord_backend::BackendError> {
            unimplemented!()
        }

        async fn get_config(&self, _: &Endpoint, _: &coord_core::RepositoryId) -> Result<bytes::Bytes, coord_backend::BackendError> {
            unimplemented!()
        }

        async fn get_info_attributes(
            &self,
            _: &Endpoint,
            _: &coord_core::RepositoryId,
        ) -> Result<bytes::Bytes, coord_backend::BackendError> {
            unimplemented!()
        }

        async fn rename(&self, _: &Endpoint, _: &coord_core::RepositoryId, _: &str) -> Result<(), coord_backend::BackendError> {
            unimplemented!()
        }

        async fn delete(&self, _: &Endpoint, _: &coord_core::RepositoryId) -> Result<(), coord_backend::BackendError> {
            unimplemented!()
        }

        async fn maintenance(
            &self,
            _: &Endpoint,
            _: &coord_core::RepositoryId,
            _: coord_core::ChangeKind,
        ) -> Result<(), coord_backend::BackendError> {
            unimplemented!()
        }

        async fn call_unary(&self, _: &Endpoint, _: &str, _: bytes::Bytes) -> Result<bytes::Bytes, coord_backend::BackendError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn probe_writes_health_and_is_healthy_becomes_true() {
        let datastore = Arc::new(MemDatastore::new());
        let backend = Arc::new(FakeBackend { fail_count: AtomicUsize::new(0) });
        let tracker = HealthTracker::new(
            "coord-1",
            datastore,
            backend,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        );
        let target = ProbeTarget {
            virtual_storage: VirtualStorage("default".into()),
            storage: StorageName("a".into()),
            endpoint: Endpoint { address: "http://a".into(), token: "t".into() },
        };
        tracker.probe_one(&target).await;
        assert!(tracker.is_healthy(&target.virtual_storage, &target.storage).await);
    }
}
