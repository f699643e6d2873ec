// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{instrument, warn};

use coord_backend::{BackendClient, EndpointTable};
use coord_core::{ChangeKind, Generation, ReplicationJob, StorageName, VirtualStorage};
use coord_datastore::{Datastore, JobResult, NewReplicationJob};

use crate::error::ReplicateError;

/// Drains the replication queue for a single `(virtual_storage, target)`
/// pair (spec.md §4.6). Several workers may be pointed at the same pair to
/// form the "fixed-size pool per target storage"; FIFO ordering within a
/// repository is enforced by the datastore's `acquire_next_job`, not by
/// the worker itself.
pub struct ReplicationWorker {
    virtual_storage: VirtualStorage,
    target: StorageName,
    endpoints: EndpointTable,
    datastore: Arc<dyn Datastore>,
    backend: Arc<dyn BackendClient>,
    max_attempts: i32,
    poll_interval: Duration,
    backoff_base: Duration,
}

impl ReplicationWorker {
    pub fn new(
        virtual_storage: VirtualStorage,
        target: StorageName,
        endpoints: EndpointTable,
        datastore: Arc<dyn Datastore>,
        backend: Arc<dyn BackendClient>,
        max_attempts: i32,
        poll_interval: Duration,
        backoff_base: Duration,
    ) -> Self {
        Self {
            virtual_storage,
            target,
            endpoints,
            datastore,
            backend,
            max_attempts,
            poll_interval,
            backoff_base,
        }
    }

    /// Runs until `shutdown` fires. An empty queue is polled at
    /// `poll_interval`; a failed job is retried in place with an
    /// exponential backoff before the worker goes back to acquiring new
    /// work, so a single lagging target does not starve other repos
    /// behind it indefinitely.
    #[instrument(name = "replication worker", skip(self, shutdown), fields(target = %self.target))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
                job = self.datastore.acquire_next_job(&self.virtual_storage, &self.target) => {
                    match job {
                        Ok(Some(job)) => self.handle(job).await,
                        Ok(None) => coord_rt::sleep(self.poll_interval).await,
                        Err(e) => {
                            warn!(error = %e, "failed to acquire next replication job");
                            coord_rt::sleep(self.poll_interval).await;
                        },
                    }
                },
            }
        }
    }

    async fn handle(&self, job: ReplicationJob) {
        let id = job.id;
        let attempt = job.attempt;
        match self.apply(&job).await {
            Ok(()) => {
                if let Err(e) = self.datastore.complete_job(id, JobResult::Completed).await {
                    warn!(error = %e, job = id, "failed to mark replication job completed");
                }
            },
            Err(e) => {
                warn!(error = %e, job = id, attempt, "replication job failed");
                if let Err(e) = self
                    .datastore
                    .complete_job(id, JobResult::Failed { error: e.to_string(), max_attempts: self.max_attempts })
                    .await
                {
                    warn!(error = %e, job = id, "failed to record replication job failure");
                    return;
                }
                if attempt < self.max_attempts {
                    self.retry(job).await;
                }
                // Past max_attempts the job is Dead; the reconciler (spec.md
                // §4.8) is what notices the repository is still lagging and
                // enqueues a fresh job for it on its next pass.
            },
        }
    }

    /// Re-enqueues a failed job after an exponential backoff. `Failed` is
    /// not itself retried by `acquire_next_job` (only `Ready` jobs are),
    /// so the new `Ready` row this creates is what actually drives the
    /// retry; `enqueue_replication`'s idempotency check does not see the
    /// `Failed` row and so does not collapse the two.
    async fn retry(&self, job: ReplicationJob) {
        let shift = job.attempt.max(0).min(6) as u32;
        let delay = self.backoff_base.saturating_mul(1 << shift);
        coord_rt::sleep(delay).await;
        if let Err(e) = self
            .datastore
            .enqueue_replication(NewReplicationJob {
                virtual_storage: job.virtual_storage,
                relative_path: job.relative_path,
                change: job.change,
                source: job.source,
                target: job.target,
                source_generation_at_enqueue: job.source_generation_at_enqueue,
                new_relative_path: job.new_relative_path,
            })
            .await
        {
            warn!(error = %e, "failed to re-enqueue replication job after backoff");
        }
    }

    #[instrument(skip(self, job), fields(job = job.id, change = ?job.change))]
    pub(crate) async fn apply(&self, job: &ReplicationJob) -> Result<(), ReplicateError> {
        let repo = job.repo();
        let target_endpoint = self.endpoints.get(&job.virtual_storage, &job.target)?.clone();

        match job.change {
            ChangeKind::Update | ChangeKind::Create => {
                let source = job
                    .source
                    .clone()
                    .ok_or_else(|| ReplicateError::MissingSource(repo.to_string()))?;

                // A job whose source generation is already met or beaten by
                // the target's current generation is stale: the target is
                // already as fresh as this job would have made it (spec.md
                // §4.6 "failure semantics").
                if let Some(wanted) = job.source_generation_at_enqueue {
                    let current = self.datastore.get_generation(&repo, &job.target).await?;
                    if !current.is_none() && current >= wanted {
                        return Ok(());
                    }
                }

                // The other half of §4.6 "failure semantics": the source
                // recorded at enqueue time can itself have fallen behind by
                // dispatch time (it may have been replaced as primary, or
                // lost its own writes to a later rename/GC). Re-resolve
                // against the authoritative generation rather than
                // replicating from a source that is no longer current; this
                // is the "requeued once with the current authoritative
                // source" rule, folded into the single dispatch a fresh
                // `acquire_next_job` already performs rather than a second
                // queue row (the idempotency key on `enqueue_replication`
                // doesn't cover `source`, so a literal second row would not
                // actually change which source an in-progress job uses).
                let replicas = self.datastore.get_replicas(&repo).await?;
                let authoritative = replicas.iter().map(|(_, gen)| *gen).max().unwrap_or(Generation::NONE);
                let source_generation = replicas
                    .iter()
                    .find(|(storage, _)| storage == &source)
                    .map(|(_, gen)| *gen)
                    .unwrap_or(Generation::NONE);
                let source = if !authoritative.is_none() && source_generation < authoritative {
                    replicas
                        .iter()
                        .find(|(storage, gen)| storage != &job.target && *gen == authoritative)
                        .map(|(storage, _)| storage.clone())
                        .unwrap_or(source)
                } else {
                    source
                };

                let source_endpoint = self.endpoints.get(&job.virtual_storage, &source)?.clone();
                let target_generation = self.datastore.get_generation(&repo, &job.target).await?;
                if target_generation.is_none() {
                    let snapshot = self.backend.get_snapshot(&source_endpoint, &repo).await?;
                    self.backend.create_repository_from_snapshot(&target_endpoint, &repo, snapshot).await?;
                } else {
                    self.backend.replicate_repository(&target_endpoint, &source_endpoint, &repo).await?;
                }

                if let Some(new_gen) = job.source_generation_at_enqueue {
                    self.datastore.set_generation(&repo, &job.target, new_gen).await?;
                }
            },

            ChangeKind::DeleteReplica => {
                self.backend.delete(&target_endpoint, &repo).await?;
                self.datastore.set_generation(&repo, &job.target, Generation::NONE).await?;
            },

            ChangeKind::Rename => {
                let new_path = job
                    .new_relative_path
                    .as_deref()
                    .ok_or_else(|| ReplicateError::MissingRenameTarget(repo.to_string()))?;
                self.backend.rename(&target_endpoint, &repo, new_path).await?;
                // The datastore moves every piece of keyed state (election
                // record included) to the new path atomically with
                // `complete_job` below, so no window exists where the
                // election record still names the pre-rename path.
            },

            kind if kind.is_maintenance() => {
                self.backend.maintenance(&target_endpoint, &repo, kind).await?;
            },

            other => return Err(ReplicateError::UnsupportedChangeKind(other)),
        }

        Ok(())
    }
}
