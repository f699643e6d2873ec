// SPDX-License-Identifier: Apache-2.0

//! Replication worker pool (spec.md §4.6): one or more workers per
//! `(virtual_storage, target)` pair, each draining
//! [`coord_datastore::Datastore::acquire_next_job`] against the backend
//! replica service.

mod error;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use coord_backend::{BackendClient, EndpointTable};
use coord_core::{StorageName, VirtualStorage};
use coord_datastore::Datastore;
use coord_rt::{Spawner, Task};

pub use error::ReplicateError;
pub use worker::ReplicationWorker;

/// Tuning knobs for a [`ReplicationPool`] (spec.md §6 "process env/config":
/// per-storage replication worker count, max replication attempts).
#[derive(Clone, Debug)]
pub struct ReplicationPoolConfig {
    pub workers_per_target: usize,
    pub max_attempts: i32,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
}

impl Default for ReplicationPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_target: 4,
            max_attempts: 5,
            poll_interval: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// A running set of [`ReplicationWorker`]s, one set per configured target
/// storage. Dropping the pool aborts every worker; prefer [`Self::shutdown`]
/// for a clean stop.
pub struct ReplicationPool {
    workers: Vec<Task<()>>,
}

impl ReplicationPool {
    /// Spawns `config.workers_per_target` workers for every `(virtual
    /// storage, target)` pair in `targets`. All workers share the same
    /// `shutdown` watch channel; send `true` on it to stop the pool.
    pub fn spawn(
        spawner: &Spawner,
        endpoints: EndpointTable,
        datastore: Arc<dyn Datastore>,
        backend: Arc<dyn BackendClient>,
        targets: Vec<(VirtualStorage, StorageName)>,
        config: ReplicationPoolConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut workers = Vec::with_capacity(targets.len() * config.workers_per_target);
        for (virtual_storage, target) in targets {
            for _ in 0..config.workers_per_target {
                let worker = Arc::new(ReplicationWorker::new(
                    virtual_storage.clone(),
                    target.clone(),
                    endpoints.clone(),
                    Arc::clone(&datastore),
                    Arc::clone(&backend),
                    config.max_attempts,
                    config.poll_interval,
                    config.backoff_base,
                ));
                let shutdown = shutdown.clone();
                workers.push(spawner.spawn(async move { worker.run(shutdown).await }));
            }
        }
        Self { workers }
    }

    /// Waits for every worker to observe shutdown and return. The caller
    /// is responsible for sending on the shutdown channel first.
    pub async fn joined(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use coord_backend::{BackendError, Endpoint, SnapshotStream};
    use coord_core::{ChangeKind, Generation, RepositoryId};
    use coord_datastore::{MemDatastore, NewReplicationJob};

    use super::*;

    fn repo() -> RepositoryId {
        RepositoryId { virtual_storage: VirtualStorage("default".into()), relative_path: "a/b.git".into() }
    }

    fn endpoints() -> EndpointTable {
        let mut entries = std::collections::HashMap::new();
        for storage in ["a", "b"] {
            entries.insert(
                (VirtualStorage("default".into()), StorageName(storage.into())),
                Endpoint { address: storage.into(), token: String::new() },
            );
        }
        EndpointTable::new(entries)
    }

    /// Records which backend calls were made, in order, so tests can
    /// assert on dispatch-by-change-kind without a live gRPC backend.
    struct RecordingBackend {
        calls: StdMutex<Vec<String>>,
        fail_replicate: bool,
    }

    #[async_trait]
    impl BackendClient for RecordingBackend {
        async fn probe(&self, _: &Endpoint, _: std::time::Duration) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn replicate_repository(&self, target: &Endpoint, source: &Endpoint, _: &RepositoryId) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("replicate {} <- {}", target.address, source.address));
            if self.fail_replicate {
                return Err(BackendError::Timeout);
            }
            Ok(())
        }
        async fn get_snapshot(&self, source: &Endpoint, _: &RepositoryId) -> Result<SnapshotStream, BackendError> {
            self.calls.lock().unwrap().push(format!("snapshot <- {}", source.address));
            let chunks: VecDeque<Result<Bytes, BackendError>> = VecDeque::from([Ok(Bytes::from_static(b"data"))]);
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
        async fn create_repository_from_snapshot(&self, target: &Endpoint, _: &RepositoryId, mut data: SnapshotStream) -> Result<(), BackendError> {
            use futures::StreamExt as _;
            while data.next().await.is_some() {}
            self.calls.lock().unwrap().push(format!("create {}", target.address));
            Ok(())
        }
        async fn get_config(&self, _: &Endpoint, _: &RepositoryId) -> Result<Bytes, BackendError> {
            unimplemented!()
        }
        async fn get_info_attributes(&self, _: &Endpoint, _: &RepositoryId) -> Result<Bytes, BackendError> {
            unimplemented!()
        }
        async fn rename(&self, target: &Endpoint, _: &RepositoryId, new_path: &str) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("rename {} -> {}", target.address, new_path));
            Ok(())
        }
        async fn delete(&self, target: &Endpoint, _: &RepositoryId) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("delete {}", target.address));
            Ok(())
        }
        async fn maintenance(&self, target: &Endpoint, _: &RepositoryId, kind: ChangeKind) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("maintenance {:?} {}", kind, target.address));
            Ok(())
        }
        async fn call_unary(&self, _: &Endpoint, _: &str, body: Bytes) -> Result<Bytes, BackendError> {
            Ok(body)
        }
    }

    #[tokio::test]
    async fn update_job_with_no_prior_copy_bootstraps_from_snapshot() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(3)).await.unwrap();
        ds.enqueue_replication(NewReplicationJob {
            virtual_storage: repo.virtual_storage.clone(),
            relative_path: repo.relative_path.clone(),
            change: ChangeKind::Update,
            source: Some(StorageName("a".into())),
            target: StorageName("b".into()),
            source_generation_at_enqueue: Some(Generation(3)),
            new_relative_path: None,
        })
        .await
        .unwrap();

        let backend = Arc::new(RecordingBackend { calls: StdMutex::new(Vec::new()), fail_replicate: false });
        let worker = ReplicationWorker::new(
            repo.virtual_storage.clone(),
            StorageName("b".into()),
            endpoints(),
            Arc::clone(&ds),
            backend.clone() as Arc<dyn BackendClient>,
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );

        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap().unwrap();
        worker.apply(&job).await.unwrap();

        assert_eq!(ds.get_generation(&repo, &StorageName("b".into())).await.unwrap(), Generation(3));
        let calls = backend.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("snapshot")));
        assert!(calls.iter().any(|c| c.starts_with("create")));
    }

    #[tokio::test]
    async fn update_job_against_already_current_target_is_a_no_op() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(3)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(3)).await.unwrap();
        ds.enqueue_replication(NewReplicationJob {
            virtual_storage: repo.virtual_storage.clone(),
            relative_path: repo.relative_path.clone(),
            change: ChangeKind::Update,
            source: Some(StorageName("a".into())),
            target: StorageName("b".into()),
            source_generation_at_enqueue: Some(Generation(3)),
            new_relative_path: None,
        })
        .await
        .unwrap();

        let backend = Arc::new(RecordingBackend { calls: StdMutex::new(Vec::new()), fail_replicate: false });
        let worker = ReplicationWorker::new(
            repo.virtual_storage.clone(),
            StorageName("b".into()),
            endpoints(),
            Arc::clone(&ds),
            backend.clone() as Arc<dyn BackendClient>,
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );

        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap().unwrap();
        worker.apply(&job).await.unwrap();
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_job_calls_the_backend_with_the_new_path() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(1)).await.unwrap();
        ds.enqueue_replication(NewReplicationJob {
            virtual_storage: repo.virtual_storage.clone(),
            relative_path: repo.relative_path.clone(),
            change: ChangeKind::Rename,
            source: None,
            target: StorageName("b".into()),
            source_generation_at_enqueue: None,
            new_relative_path: Some("a/renamed.git".into()),
        })
        .await
        .unwrap();

        let backend = Arc::new(RecordingBackend { calls: StdMutex::new(Vec::new()), fail_replicate: false });
        let worker = ReplicationWorker::new(
            repo.virtual_storage.clone(),
            StorageName("b".into()),
            endpoints(),
            Arc::clone(&ds),
            backend.clone() as Arc<dyn BackendClient>,
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );

        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap().unwrap();
        worker.apply(&job).await.unwrap();
        assert!(backend.calls.lock().unwrap()[0].contains("a/renamed.git"));
    }

    #[tokio::test]
    async fn rename_job_with_no_new_path_fails_fast() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(1)).await.unwrap();
        ds.enqueue_replication(NewReplicationJob {
            virtual_storage: repo.virtual_storage.clone(),
            relative_path: repo.relative_path.clone(),
            change: ChangeKind::Rename,
            source: None,
            target: StorageName("b".into()),
            source_generation_at_enqueue: None,
            new_relative_path: None,
        })
        .await
        .unwrap();

        let backend = Arc::new(RecordingBackend { calls: StdMutex::new(Vec::new()), fail_replicate: false });
        let worker = ReplicationWorker::new(
            repo.virtual_storage.clone(),
            StorageName("b".into()),
            endpoints(),
            Arc::clone(&ds),
            backend as Arc<dyn BackendClient>,
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        );

        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap().unwrap();
        let err = worker.apply(&job).await.unwrap_err();
        assert!(matches!(err, ReplicateError::MissingRenameTarget(_)));
    }
}
