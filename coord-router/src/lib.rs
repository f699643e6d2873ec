// SPDX-License-Identifier: Apache-2.0

//! Request router (spec.md §4.4): classifies each incoming RPC and picks
//! the primary/participant set it should be fanned out to, from a recently
//! cached election and health snapshot.

mod outcome;
mod router;
mod topology;

pub use outcome::RouteOutcome;
pub use router::Router;
pub use topology::VirtualStorageTopology;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use coord_backend::{BackendClient, BackendError, Endpoint, SnapshotStream};
    use coord_core::{
        Assignment,
        ChangeKind,
        ElectionRecord,
        Generation,
        RepoFieldPath,
        RepositoryId,
        RpcDescriptor,
        RpcKind,
        RpcScope,
        StorageName,
        VirtualStorage,
    };
    use coord_datastore::{Datastore, MemDatastore};
    use coord_health::HealthTracker;

    use super::*;

    struct AlwaysUp;

    #[async_trait]
    impl BackendClient for AlwaysUp {
        async fn probe(&self, _endpoint: &Endpoint, _deadline: Duration) -> Result<(), BackendError> {
            Ok(())
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
        async fn call_unary(&self, _: &Endpoint, _: &str, _: Bytes) -> Result<Bytes, BackendError> {
            unimplemented!()
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

    async fn setup(healthy: &[&str], generations: &[(&str, i64)], primary: &str) -> (Router, RepositoryId) {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        for (storage, gen) in generations {
            ds.set_generation(&repo, &StorageName((*storage).into()), Generation(*gen)).await.unwrap();
        }
        ds.try_elect(&repo, Some(StorageName(primary.into())), None).await.unwrap();

        let health = Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(&ds),
            Arc::new(AlwaysUp),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ));
        for storage in healthy {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName((*storage).into()), 0).await.unwrap();
        }

        let topology = VirtualStorageTopology::new(
            repo.virtual_storage.clone(),
            generations.iter().map(|(s, _)| StorageName((*s).into())).collect(),
        );
        (Router::new(vec![topology], ds, health), repo)
    }

    #[tokio::test]
    async fn mutator_routes_to_primary_and_up_to_date_secondaries() {
        let (router, repo) = setup(&["a", "b", "c"], &[("a", 1), ("b", 1), ("c", 0)], "a").await;
        let outcome = router.route(&mutator_descriptor(), &repo.virtual_storage, Some(&repo)).await.unwrap();
        match outcome {
            RouteOutcome::Mutator { primary, secondaries, expected_generation } => {
                assert_eq!(primary, StorageName("a".into()));
                assert_eq!(secondaries, vec![StorageName("b".into())]);
                assert_eq!(expected_generation, Generation(1));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_primary_elected_fails_mutator_routing() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        let health = Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(&ds),
            Arc::new(AlwaysUp),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ));
        let topology = VirtualStorageTopology::new(repo.virtual_storage.clone(), vec![StorageName("a".into())]);
        let router = Router::new(vec![topology], ds, health);
        let err = router.route(&mutator_descriptor(), &repo.virtual_storage, Some(&repo)).await.unwrap_err();
        assert!(matches!(err, coord_core::CoreError::NoPrimary));
    }

    #[tokio::test]
    async fn assignment_restricts_secondaries() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        for (storage, gen) in [("a", 1), ("b", 1), ("c", 1)] {
            ds.set_generation(&repo, &StorageName(storage.into()), Generation(gen)).await.unwrap();
        }
        ds.try_elect(&repo, Some(StorageName("a".into())), None).await.unwrap();
        ds.set_assignments(&repo, Assignment { storages: vec![StorageName("a".into()), StorageName("b".into())] })
            .await
            .unwrap();

        let health = Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(&ds),
            Arc::new(AlwaysUp),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ));
        for storage in ["a", "b", "c"] {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName(storage.into()), 0).await.unwrap();
        }
        let topology = VirtualStorageTopology::new(repo.virtual_storage.clone(), vec![StorageName("a".into()), StorageName("b".into()), StorageName("c".into())]);
        let router = Router::new(vec![topology], ds, health);

        let outcome = router.route(&mutator_descriptor(), &repo.virtual_storage, Some(&repo)).await.unwrap();
        match outcome {
            RouteOutcome::Mutator { secondaries, .. } => assert_eq!(secondaries, vec![StorageName("b".into())]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_repository_fails_accessor_routing() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(1)).await.unwrap();
        let election = ElectionRecord::read_only(repo.clone(), 0);
        assert!(election.demoted);
        assert!(election.primary.is_none());

        let health = Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(&ds),
            Arc::new(AlwaysUp),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ));
        let topology = VirtualStorageTopology::new(repo.virtual_storage.clone(), vec![StorageName("a".into())]);
        let router = Router::new(vec![topology], ds, health);

        let accessor = RpcDescriptor {
            service: "repo.v1.RepositoryService".into(),
            method: "ReadRef".into(),
            kind: RpcKind::Accessor,
            scope: RpcScope::RepositoryScoped { field: RepoFieldPath("repository".into()) },
        };
        // `a` was never marked healthy, so no candidate exists regardless
        // of the (absent) election record.
        let err = router.route(&accessor, &repo.virtual_storage, Some(&repo)).await.unwrap_err();
        assert!(matches!(err, coord_core::CoreError::RepositoryReadOnly));
    }
}
