// SPDX-License-Identifier: Apache-2.0

//! Primary elector (spec.md §4.7): per-repository primary selection from
//! health, generation, and assignment state, demoting a repository to
//! read-only when no safe primary exists. Invoked for initial priming at
//! coordinator startup, on every health probe cycle, and on explicit
//! operator command — all three are the same [`Elector::elect_one`] call,
//! run either once or in the periodic [`Elector::run`] loop.

mod error;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use coord_core::{DataLossAudit, Generation, RepositoryId, StorageName};
use coord_datastore::Datastore;
use coord_health::HealthTracker;

pub use error::ElectError;

/// Outcome of one election pass over a single repository.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectionOutcome {
    /// `storage` was confirmed or newly chosen as primary.
    Elected(StorageName),
    /// No candidate qualified; the repository is now read-only.
    ReadOnly,
    /// Another coordinator elected concurrently; this pass deferred to it.
    Conflict,
}

/// Runs the per-repository election algorithm (spec.md §4.7) against a
/// [`Datastore`] and a [`HealthTracker`] shared with the rest of the
/// coordinator.
pub struct Elector {
    datastore: Arc<dyn Datastore>,
    health: Arc<HealthTracker>,
    failed_job_window: Duration,
}

impl Elector {
    pub fn new(datastore: Arc<dyn Datastore>, health: Arc<HealthTracker>, failed_job_window: Duration) -> Self {
        Self { datastore, health, failed_job_window }
    }

    /// Runs until `shutdown` fires, re-electing every repository `catalog`
    /// names once per `interval`. `catalog` is re-read on every pass so
    /// newly created repositories are picked up without a restart.
    #[instrument(name = "election loop", skip(self, catalog, shutdown))]
    pub async fn run<F, Fut>(&self, mut catalog: F, interval: Duration, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RepositoryId>, ElectError>>,
    {
        let mut ticks = coord_rt::interval(interval, Duration::from_secs(1));
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
                    match catalog().await {
                        Ok(repos) => self.elect_all(&repos).await,
                        Err(e) => warn!(error = %e, "failed to list repositories for election pass"),
                    }
                },
            }
        }
    }

    /// Runs [`Self::elect_one`] for every repository in `repos`, logging
    /// and continuing past individual failures so one bad repository does
    /// not stall the whole pass.
    pub async fn elect_all(&self, repos: &[RepositoryId]) {
        for repo in repos {
            match self.elect_one(repo).await {
                Ok(ElectionOutcome::Elected(storage)) => info!(%repo, primary = %storage, "elected primary"),
                Ok(ElectionOutcome::ReadOnly) => warn!(%repo, "no eligible primary; repository is read-only"),
                Ok(ElectionOutcome::Conflict) => info!(%repo, "election superseded by a concurrent coordinator"),
                Err(e) => warn!(%repo, error = %e, "election pass failed"),
            }
        }
    }

    /// The four-step algorithm of spec.md §4.7 for a single repository.
    #[instrument(skip(self), fields(%repo))]
    pub async fn elect_one(&self, repo: &RepositoryId) -> Result<ElectionOutcome, ElectError> {
        let current = self.datastore.get_election(repo).await?;
        let expected_current = current.as_ref().and_then(|e| e.primary.clone());

        let candidates = self.candidates(repo).await?;

        // Step 2: prefer the current primary if it is still a candidate.
        let chosen = match &expected_current {
            Some(primary) if candidates.contains(primary) => Some(primary.clone()),
            _ => self.best_candidate(repo, &candidates).await?,
        };

        match chosen {
            Some(storage) => {
                if self.datastore.try_elect(repo, Some(storage.clone()), expected_current).await? {
                    Ok(ElectionOutcome::Elected(storage))
                } else {
                    // Lost a race with another coordinator; one retry with
                    // freshly-read state (spec.md §4.7 step 4).
                    self.retry_once(repo).await
                }
            },
            None => {
                if self.datastore.try_elect(repo, None, expected_current).await? {
                    Ok(ElectionOutcome::ReadOnly)
                } else {
                    self.retry_once(repo).await
                }
            },
        }
    }

    async fn retry_once(&self, repo: &RepositoryId) -> Result<ElectionOutcome, ElectError> {
        let current = self.datastore.get_election(repo).await?;
        let expected_current = current.as_ref().and_then(|e| e.primary.clone());
        let candidates = self.candidates(repo).await?;
        let chosen = match &expected_current {
            Some(primary) if candidates.contains(primary) => Some(primary.clone()),
            _ => self.best_candidate(repo, &candidates).await?,
        };
        let applied = self.datastore.try_elect(repo, chosen.clone(), expected_current).await?;
        if !applied {
            return Ok(ElectionOutcome::Conflict);
        }
        Ok(chosen.map(ElectionOutcome::Elected).unwrap_or(ElectionOutcome::ReadOnly))
    }

    /// Step 1: cluster-healthy, at the authoritative generation, and
    /// assigned (if any assignment restricts this repository).
    async fn candidates(&self, repo: &RepositoryId) -> Result<Vec<StorageName>, ElectError> {
        let replicas = self.datastore.get_replicas(repo).await?;
        let authoritative = replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE);
        let assignment = self.datastore.get_assignments(repo).await?;

        let mut out = Vec::new();
        for (storage, generation) in &replicas {
            if *generation != authoritative || !assignment.permits(storage) {
                continue;
            }
            if self.health.is_healthy(&repo.virtual_storage, storage).await {
                out.push(storage.clone());
            }
        }
        Ok(out)
    }

    /// Step 2 fallback: fewest failed replication jobs in the configured
    /// window, ties broken by stable (lexicographic) name order.
    async fn best_candidate(&self, repo: &RepositoryId, candidates: &[StorageName]) -> Result<Option<StorageName>, ElectError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        // TODO: `failed_job_count` has no enqueue timestamp to bound by
        // `failed_job_window`; it reports a present-tense count instead
        // (see coord_datastore::Datastore::failed_job_count).
        let mut scored = Vec::with_capacity(candidates.len());
        for storage in candidates {
            let failed = self.datastore.failed_job_count(&repo.virtual_storage, storage).await?;
            scored.push((failed, storage.clone()));
        }
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored.into_iter().next().map(|(_, s)| s))
    }

    /// Operator-initiated data-loss acceptance (spec.md §4.7 "Read-only
    /// recovery"): promotes `storage` by setting its generation to the
    /// authoritative generation minus `known_losses`, records an audit
    /// entry, and re-runs the election so the promoted storage actually
    /// becomes primary. The caller (coord-reconcile or an operator-facing
    /// RPC) is responsible for scheduling the reconciliation jobs this
    /// implies from the new primary to every other replica.
    #[instrument(skip(self, reason), fields(%repo, %storage))]
    pub async fn accept_data_loss(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
        known_losses: i64,
        operator: &str,
        reason: impl Into<String>,
        now_unix: i64,
    ) -> Result<ElectionOutcome, ElectError> {
        let replicas = self.datastore.get_replicas(repo).await?;
        let authoritative = replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE);
        let previous = replicas.iter().find(|(s, _)| s == storage).map(|(_, g)| *g).unwrap_or(Generation::NONE);
        let accepted = Generation((authoritative.0 - known_losses).max(0));

        self.datastore.set_generation(repo, storage, accepted).await?;
        self.datastore
            .record_data_loss_audit(DataLossAudit {
                repo: repo.clone(),
                storage: storage.clone(),
                accepted_generation: accepted,
                previous_generation: previous,
                operator: operator.to_string(),
                at_unix: now_unix,
                reason: reason.into(),
            })
            .await?;

        self.elect_one(repo).await
    }
}

/// A fixed, config-supplied repository catalog, used where the full set
/// of repositories is known up front rather than discovered from the
/// datastore (mirrors [`coord_router::VirtualStorageTopology`]'s role for
/// the router).
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog(pub Vec<RepositoryId>);

impl StaticCatalog {
    pub async fn list(&self) -> Result<Vec<RepositoryId>, ElectError> {
        Ok(self.0.clone())
    }
}

/// Convenience: an [`Elector`] catalog function backed directly by
/// [`Datastore::list_repositories`], covering every repository the
/// datastore has any row for. Takes an owned `Arc` clone so callers can
/// build a `FnMut() -> impl Future` closure for [`Elector::run`] without
/// the returned future borrowing from the closure's captured state.
pub async fn datastore_catalog(datastore: Arc<dyn Datastore>) -> Result<Vec<RepositoryId>, ElectError> {
    Ok(datastore.list_repositories().await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use coord_backend::{BackendClient, BackendError, Endpoint, SnapshotStream};
    use coord_core::{ChangeKind, Generation, RepositoryId, StorageName, VirtualStorage};
    use coord_datastore::{Datastore, MemDatastore};
    use coord_health::HealthTracker;

    use super::*;

    struct AlwaysUp;

    #[async_trait]
    impl BackendClient for AlwaysUp {
        async fn probe(&self, _: &Endpoint, _: Duration) -> Result<(), BackendError> {
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
        async fn call_unary(&self, _: &Endpoint, _: &str, body: Bytes) -> Result<Bytes, BackendError> {
            Ok(body)
        }
    }

    fn repo() -> RepositoryId {
        RepositoryId { virtual_storage: VirtualStorage("default".into()), relative_path: "a/b.git".into() }
    }

    async fn health(ds: &Arc<dyn Datastore>) -> Arc<HealthTracker> {
        Arc::new(HealthTracker::new(
            "coord-1",
            Arc::clone(ds),
            Arc::new(AlwaysUp),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(0),
        ))
    }

    /// Scenario 4 (spec.md §8): primary demotion when A goes unhealthy but
    /// B and C are healthy and at the authoritative generation.
    #[tokio::test]
    async fn demotes_to_healthiest_caught_up_candidate() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        for (storage, gen) in [("a", 1), ("b", 1), ("c", 1)] {
            ds.set_generation(&repo, &StorageName(storage.into()), Generation(gen)).await.unwrap();
        }
        ds.try_elect(&repo, Some(StorageName("a".into())), None).await.unwrap();
        for storage in ["b", "c"] {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName(storage.into()), 0).await.unwrap();
        }

        let health = health(&ds).await;
        let elector = Elector::new(Arc::clone(&ds), health, Duration::from_secs(3600));
        let outcome = elector.elect_one(&repo).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Elected(StorageName("b".into())));

        let election = ds.get_election(&repo).await.unwrap().unwrap();
        assert!(!election.demoted);
    }

    /// Scenario 5 (spec.md §8): all replicas lagging behind the
    /// authoritative generation leaves the repository read-only; A
    /// returning healthy and caught up promotes it back.
    #[tokio::test]
    async fn marks_read_only_when_no_candidate_qualifies_then_recovers() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(5)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(3)).await.unwrap();
        ds.set_generation(&repo, &StorageName("c".into()), Generation(2)).await.unwrap();
        ds.try_elect(&repo, Some(StorageName("a".into())), None).await.unwrap();
        for storage in ["b", "c"] {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName(storage.into()), 0).await.unwrap();
        }

        let health = health(&ds).await;
        let elector = Elector::new(Arc::clone(&ds), health, Duration::from_secs(3600));
        let outcome = elector.elect_one(&repo).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::ReadOnly);
        let election = ds.get_election(&repo).await.unwrap().unwrap();
        assert!(election.demoted);
        assert!(election.primary.is_none());

        ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName("a".into()), 0).await.unwrap();
        let outcome = elector.elect_one(&repo).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Elected(StorageName("a".into())));
        let election = ds.get_election(&repo).await.unwrap().unwrap();
        assert!(!election.demoted);
    }

    #[tokio::test]
    async fn current_primary_is_preferred_even_if_not_lowest_failure_count() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        for (storage, gen) in [("a", 1), ("b", 1)] {
            ds.set_generation(&repo, &StorageName(storage.into()), Generation(gen)).await.unwrap();
        }
        ds.try_elect(&repo, Some(StorageName("a".into())), None).await.unwrap();
        for storage in ["a", "b"] {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName(storage.into()), 0).await.unwrap();
        }
        ds.enqueue_replication(coord_datastore::NewReplicationJob {
            virtual_storage: repo.virtual_storage.clone(),
            relative_path: repo.relative_path.clone(),
            change: ChangeKind::Update,
            source: Some(StorageName("b".into())),
            target: StorageName("a".into()),
            source_generation_at_enqueue: Some(Generation(1)),
            new_relative_path: None,
        })
        .await
        .unwrap();
        ds.complete_job(1, coord_datastore::JobResult::Failed { error: "boom".into(), max_attempts: 5 }).await.unwrap();

        let health = health(&ds).await;
        let elector = Elector::new(Arc::clone(&ds), health, Duration::from_secs(3600));
        let outcome = elector.elect_one(&repo).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Elected(StorageName("a".into())));
    }

    #[tokio::test]
    async fn accept_data_loss_promotes_a_lagging_storage() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(5)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(2)).await.unwrap();
        for storage in ["a", "b"] {
            ds.upsert_health("coord-1", &repo.virtual_storage, &StorageName(storage.into()), 0).await.unwrap();
        }
        ds.try_elect(&repo, None, None).await.unwrap();

        let health = health(&ds).await;
        let elector = Elector::new(Arc::clone(&ds), health, Duration::from_secs(3600));
        // B never caught up to A, but the operator accepts the loss.
        let outcome = elector.accept_data_loss(&repo, &StorageName("b".into()), 0, "op", "disk loss on a", 0).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Elected(StorageName("b".into())));
        assert_eq!(ds.get_generation(&repo, &StorageName("b".into())).await.unwrap(), Generation(5));
    }
}
