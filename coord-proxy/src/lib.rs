// SPDX-License-Identifier: Apache-2.0

//! The coordinator (spec.md §4.5): the one place that assembles the
//! router, the transaction registry, and the replication queue around
//! every call. [`proto`]/[`voting`] implement the small internal RPC the
//! reference-transaction hook calls back into; everything else is plain
//! Rust reachable from any transport.

mod coordinator;
mod proto;
mod status;
mod voting;

pub use coordinator::{Coordinator, MutatorOutcome};
pub use proto::voting_service_server::{VotingService, VotingServiceServer};
pub use proto::{VoteRequest, VoteResponse};
pub use status::to_status;
pub use voting::VotingEndpoint;

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::collections::{HashMap, HashSet};
    use std::hash::{Hash, Hasher};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use coord_backend::{BackendClient, BackendError, Endpoint, EndpointTable, SnapshotStream};
    use coord_core::{ChangeKind, Generation, RepoFieldPath, RepositoryId, RpcDescriptor, RpcKind, RpcScope, StorageName, VirtualStorage};
    use coord_datastore::{Datastore, MemDatastore};
    use coord_health::HealthTracker;
    use coord_router::{Router, VirtualStorageTopology};
    use coord_txn::{Outcome, Registry};

    use super::*;

    fn hash20(data: &[u8]) -> [u8; 20] {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let digest = hasher.finish().to_be_bytes();
        let mut out = [0u8; 20];
        out[..8].copy_from_slice(&digest);
        out
    }

    /// A backend that runs the transactional vote inline, the way a real
    /// replica's reference-transaction hook would from inside its own RPC
    /// handler, standing in for the real gRPC round trip to `VotingService`.
    struct FakeBackend {
        registry: Arc<Registry>,
        unreachable: HashSet<String>,
        dissent: HashSet<String>,
    }

    #[async_trait]
    impl BackendClient for FakeBackend {
        async fn probe(&self, _: &Endpoint, _: Duration) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn replicate_repository(&self, _: &Endpoint, _: &Endpoint, _: &RepositoryId) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn get_snapshot(&self, _: &Endpoint, _: &RepositoryId) -> Result<SnapshotStream, BackendError> {
            unimplemented!()
        }
        async fn create_repository_from_snapshot(&self, _: &Endpoint, _: &RepositoryId, _: SnapshotStream) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn get_config(&self, _: &Endpoint, _: &RepositoryId) -> Result<Bytes, BackendError> {
            unimplemented!()
        }
        async fn get_info_attributes(&self, _: &Endpoint, _: &RepositoryId) -> Result<Bytes, BackendError> {
            unimplemented!()
        }
        async fn rename(&self, _: &Endpoint, _: &RepositoryId, _: &str) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn delete(&self, _: &Endpoint, _: &RepositoryId) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn maintenance(&self, _: &Endpoint, _: &RepositoryId, _: ChangeKind) -> Result<(), BackendError> {
            unimplemented!()
        }
        async fn call_unary(&self, _: &Endpoint, _: &str, body: Bytes) -> Result<Bytes, BackendError> {
            Ok(body)
        }
        async fn call_transactional(
            &self,
            endpoint: &Endpoint,
            _method_path: &str,
            body: Bytes,
            transaction_id: u32,
            _coordinator_address: &str,
        ) -> Result<Bytes, BackendError> {
            let storage = endpoint.address.clone();
            if self.unreachable.contains(&storage) {
                return Err(BackendError::Transport("simulated network failure".into()));
            }
            let mut hash = hash20(&body);
            if self.dissent.contains(&storage) {
                hash[0] ^= 0xff;
            }
            let outcome = self
                .registry
                .vote(transaction_id, &storage, hash)
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            match outcome {
                Outcome::Commit => Ok(body),
                Outcome::Abort => Err(BackendError::Status(tonic::Status::aborted("vote aborted"))),
                Outcome::Stop => Err(BackendError::Timeout),
            }
        }
    }

    fn repo() -> RepositoryId {
        RepositoryId { virtual_storage: VirtualStorage("default".into()), relative_path: "a/b.git".into() }
    }

    fn mutator_descriptor() -> RpcDescriptor {
        RpcDescriptor {
            service: "repo.v1.RepositoryService".into(),
            method: "WriteRef".into(),
            kind: RpcKind::TransactionalMutator,
            scope: RpcScope::RepositoryScoped { field: RepoFieldPath("repository".into()) },
        }
    }

    async fn setup(
        storages: &[&str],
        unreachable: &[&str],
        dissent: &[&str],
    ) -> (Coordinator, RepositoryId) {
        setup_with_tolerance(storages, unreachable, dissent, 0).await
    }

    async fn setup_with_tolerance(
        storages: &[&str],
        unreachable: &[&str],
        dissent: &[&str],
        max_tolerated_vote_failures: u32,
    ) -> (Coordinator, RepositoryId) {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        for storage in storages {
            ds.set_generation(&repo, &StorageName((*storage).into()), Generation(1)).await.unwrap();
        }
        ds.try_elect(&repo, Some(StorageName(storages[0].into())), None).await.unwrap();

        let health = Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(&ds),
            Arc::new(FakeBackend { registry: Arc::new(Registry::new()), unreachable: HashSet::new(), dissent: HashSet::new() }),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ));
        for storage in storages {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName((*storage).into()), 0).await.unwrap();
        }

        let topology = VirtualStorageTopology::new(repo.virtual_storage.clone(), storages.iter().map(|s| StorageName((*s).into())).collect());
        let router = Arc::new(Router::new(vec![topology], Arc::clone(&ds), health));

        let registry = Arc::new(Registry::new());
        let backend: Arc<dyn BackendClient> = Arc::new(FakeBackend {
            registry: Arc::clone(&registry),
            unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
            dissent: dissent.iter().map(|s| s.to_string()).collect(),
        });

        let mut entries = HashMap::new();
        for storage in storages {
            entries.insert(
                (repo.virtual_storage.clone(), StorageName((*storage).into())),
                Endpoint { address: (*storage).into(), token: String::new() },
            );
        }
        let endpoints = EndpointTable::new(entries);

        let coordinator = Coordinator::with_vote_tolerance(
            router,
            registry,
            ds,
            backend,
            endpoints,
            Duration::from_secs(5),
            "coord-1:9000".into(),
            max_tolerated_vote_failures,
        );
        (coordinator, repo)
    }

    #[tokio::test]
    async fn all_participants_agree_commits_inline() {
        let (coordinator, repo) = setup(&["a", "b", "c"], &[], &[]).await;
        let outcome = coordinator
            .dispatch(&mutator_descriptor(), &repo.virtual_storage, Some(&repo), None, None, "/repo.v1.RepositoryService/WriteRef", Bytes::from_static(b"update"))
            .await
            .unwrap();
        assert_eq!(outcome, Bytes::from_static(b"update"));
    }

    #[tokio::test]
    async fn primary_rpc_failure_fails_the_call_and_changes_nothing() {
        let (coordinator, repo) = setup(&["a", "b", "c"], &["a"], &[]).await;
        let err = coordinator
            .dispatch(&mutator_descriptor(), &repo.virtual_storage, Some(&repo), None, None, "/repo.v1.RepositoryService/WriteRef", Bytes::from_static(b"update"))
            .await
            .unwrap_err();
        assert!(matches!(err, coord_core::CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn one_dissenting_secondary_aborts_under_strong_voting() {
        let (coordinator, repo) = setup(&["a", "b", "c"], &[], &["c"]).await;
        let err = coordinator
            .dispatch(&mutator_descriptor(), &repo.virtual_storage, Some(&repo), None, None, "/repo.v1.RepositoryService/WriteRef", Bytes::from_static(b"update"))
            .await
            .unwrap_err();
        assert!(matches!(err, coord_core::CoreError::Unavailable(_)));
    }

    /// spec.md §8 scenario 2: with the coordinator configured to tolerate
    /// one vote failure, a single dissenting secondary does not abort the
    /// whole transaction — the primary and the agreeing secondary commit,
    /// the dissenter is left behind and replication is scheduled for it.
    #[tokio::test]
    async fn tolerant_voting_commits_despite_one_dissenting_secondary() {
        let (coordinator, repo) = setup_with_tolerance(&["a", "b", "c"], &[], &["c"], 1).await;
        let outcome = coordinator
            .dispatch(&mutator_descriptor(), &repo.virtual_storage, Some(&repo), None, None, "/repo.v1.RepositoryService/WriteRef", Bytes::from_static(b"update"))
            .await
            .unwrap();
        assert_eq!(outcome, Bytes::from_static(b"update"));
    }
}
