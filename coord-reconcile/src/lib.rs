// SPDX-License-Identifier: Apache-2.0

//! Reconciler (spec.md §4.8): a background scanner that periodically
//! iterates [`Datastore::list_outdated`] and enqueues an update job for
//! every `(repo, storage)` whose generation trails the authoritative
//! generation, closing the holes the online path leaves behind — most
//! notably a coordinator crash between a mutator's generation bump and
//! the replication job that should have followed it (spec.md §4.5 step 7
//! / §9).

mod error;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use coord_core::{ChangeKind, Generation, RepositoryId, StorageName};
use coord_datastore::{Datastore, NewReplicationJob};

pub use error::ReconcileError;

/// Drives repeated reconciliation passes over the datastore's
/// outdated-repository view.
pub struct Reconciler {
    datastore: Arc<dyn Datastore>,
}

impl Reconciler {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Runs until `shutdown` fires, running one full pass every `interval`.
    #[instrument(name = "reconciler loop", skip(self, shutdown))]
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
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
                    if let Err(e) = self.pass().await {
                        warn!(error = %e, "reconciliation pass failed");
                    }
                },
            }
        }
    }

    /// One scan: for every repository `list_outdated` names, enqueue an
    /// update job for every replica trailing the authoritative generation.
    /// `enqueue_replication`'s idempotency (spec.md §4.1) means a job
    /// already in flight for that `(repo, target)` is not duplicated.
    #[instrument(skip(self))]
    pub async fn pass(&self) -> Result<usize, ReconcileError> {
        let outdated = self.datastore.list_outdated().await?;
        let mut scheduled = 0;
        for repo in outdated {
            scheduled += self.reconcile_one(&repo).await?;
        }
        Ok(scheduled)
    }

    #[instrument(skip(self), fields(%repo))]
    async fn reconcile_one(&self, repo: &RepositoryId) -> Result<usize, ReconcileError> {
        let replicas = self.datastore.get_replicas(repo).await?;
        let authoritative = replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE);
        let source = match replicas.iter().find(|(_, g)| *g == authoritative) {
            Some((storage, _)) => storage.clone(),
            None => return Ok(0),
        };

        let mut scheduled = 0;
        for (storage, generation) in &replicas {
            if *generation >= authoritative {
                continue;
            }
            self.enqueue_catch_up(repo, &source, storage, authoritative).await?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    async fn enqueue_catch_up(
        &self,
        repo: &RepositoryId,
        source: &StorageName,
        target: &StorageName,
        authoritative: Generation,
    ) -> Result<(), ReconcileError> {
        let (_, already_existed) = self
            .datastore
            .enqueue_replication(NewReplicationJob {
                virtual_storage: repo.virtual_storage.clone(),
                relative_path: repo.relative_path.clone(),
                change: ChangeKind::Update,
                source: Some(source.clone()),
                target: target.clone(),
                source_generation_at_enqueue: Some(authoritative),
                new_relative_path: None,
            })
            .await?;
        if !already_existed {
            info!(%repo, %source, %target, generation = %authoritative, "reconciler scheduled catch-up replication");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coord_core::{RepositoryId, StorageName, VirtualStorage};
    use coord_datastore::{Datastore, JobState, MemDatastore};

    use super::*;

    fn repo() -> RepositoryId {
        RepositoryId { virtual_storage: VirtualStorage("default".into()), relative_path: "a/b.git".into() }
    }

    #[tokio::test]
    async fn schedules_catch_up_for_every_lagging_replica() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(5)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(3)).await.unwrap();
        ds.set_generation(&repo, &StorageName("c".into()), Generation(5)).await.unwrap();

        let reconciler = Reconciler::new(Arc::clone(&ds));
        let scheduled = reconciler.pass().await.unwrap();
        assert_eq!(scheduled, 1);

        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap().unwrap();
        assert_eq!(job.source, Some(StorageName("a".into())));
        assert!(matches!(job.state, JobState::InProgress));
    }

    #[tokio::test]
    async fn a_second_pass_does_not_duplicate_an_already_queued_job() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(2)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(0)).await.unwrap();

        let reconciler = Reconciler::new(Arc::clone(&ds));
        assert_eq!(reconciler.pass().await.unwrap(), 1);
        assert_eq!(reconciler.pass().await.unwrap(), 1);

        // Only one job actually exists despite two passes scheduling it.
        let job = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap();
        assert!(job.is_some());
        let next = ds.acquire_next_job(&repo.virtual_storage, &StorageName("b".into())).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn an_up_to_date_repository_is_never_returned_by_list_outdated() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let repo = repo();
        ds.set_generation(&repo, &StorageName("a".into()), Generation(1)).await.unwrap();
        ds.set_generation(&repo, &StorageName("b".into()), Generation(1)).await.unwrap();

        let reconciler = Reconciler::new(Arc::clone(&ds));
        assert_eq!(reconciler.pass().await.unwrap(), 0);
    }
}
