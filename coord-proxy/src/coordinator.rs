// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::instrument;

use coord_backend::BackendClient;
use coord_core::{Assignment, ChangeKind, CoreError, Generation, RepositoryId, RpcDescriptor, StorageName, VirtualStorage};
use coord_datastore::{Datastore, NewReplicationJob};
use coord_router::{RouteOutcome, Router};
use coord_txn::{ParticipantStatus, Registry, Voter};

use coord_backend::EndpointTable;

/// Result of a successful transactional mutator call (spec.md §4.5).
#[derive(Clone, Debug)]
pub struct MutatorOutcome {
    pub primary_response: Bytes,
    /// Participants whose reference-transaction hook committed.
    pub applied: Vec<StorageName>,
    /// Participants that did not apply the change; a replication job was
    /// enqueued for each.
    pub queued_for_replication: Vec<StorageName>,
}

/// Wraps the router, the transaction registry, and the replication queue
/// around every call the coordinator handles (spec.md §4.5). This is the
/// "proxy" the rest of the system refers to: the one place the eight-step
/// mutator flow is assembled end to end.
pub struct Coordinator {
    router: Arc<Router>,
    registry: Arc<Registry>,
    datastore: Arc<dyn Datastore>,
    backend: Arc<dyn BackendClient>,
    endpoints: EndpointTable,
    /// Per-repository exclusive lock (spec.md §5: "at most one in-flight
    /// mutator per repository"). Entries are never removed; a coordinator
    /// sees a bounded number of distinct repositories over its lifetime so
    /// this does not unboundedly leak in practice, unlike per-call state.
    repo_locks: DashMap<RepositoryId, Arc<tokio::sync::Mutex<()>>>,
    vote_timeout: Duration,
    coordinator_address: String,
    /// How many participants a vote may lose and still commit (spec.md
    /// §4.5 step 2). 0 means strong voting: every addressed participant
    /// must agree.
    max_tolerated_vote_failures: u32,
}

impl Coordinator {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<Registry>,
        datastore: Arc<dyn Datastore>,
        backend: Arc<dyn BackendClient>,
        endpoints: EndpointTable,
        vote_timeout: Duration,
        coordinator_address: String,
    ) -> Self {
        Self::with_vote_tolerance(router, registry, datastore, backend, endpoints, vote_timeout, coordinator_address, 0)
    }

    /// As [`Self::new`], but allowing up to `max_tolerated_vote_failures`
    /// participants to dissent or fail their vote while the transaction
    /// still commits for the rest (spec.md §4.5 step 2: "strong voting;
    /// configurable to allow failures"). The effective threshold is always
    /// clamped to the registry's required minimum strict majority.
    #[allow(clippy::too_many_arguments)]
    pub fn with_vote_tolerance(
        router: Arc<Router>,
        registry: Arc<Registry>,
        datastore: Arc<dyn Datastore>,
        backend: Arc<dyn BackendClient>,
        endpoints: EndpointTable,
        vote_timeout: Duration,
        coordinator_address: String,
        max_tolerated_vote_failures: u32,
    ) -> Self {
        Self {
            router,
            registry,
            datastore,
            backend,
            endpoints,
            repo_locks: DashMap::new(),
            vote_timeout,
            coordinator_address,
            max_tolerated_vote_failures,
        }
    }

    /// The commit threshold for a vote among `total_voters` participants:
    /// every voter minus up to `max_tolerated_vote_failures`, never lower
    /// than the registry's required strict majority (spec.md §4.3).
    fn vote_threshold(&self, total_voters: u32) -> u32 {
        let min = (total_voters + 2) / 2;
        total_voters.saturating_sub(self.max_tolerated_vote_failures).max(min)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    fn endpoint(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> Result<&coord_backend::Endpoint, CoreError> {
        self.endpoints.get(virtual_storage, storage).map_err(|e| CoreError::NotFound(e.to_string()))
    }

    async fn lock_repo(&self, repo: &RepositoryId) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .repo_locks
            .entry(repo.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Dispatch one client-facing call. `change` is only consulted for
    /// maintenance mutators, where the caller already knows which
    /// maintenance operation it is invoking (spec.md §4.4). `new_relative_path`
    /// is only consulted when `change` is `Rename`: the path the repository
    /// moves to, which the datastore applies atomically with the
    /// replication jobs this schedules for every non-primary replica
    /// (spec.md §9 open question 2).
    #[instrument(skip(self, body), fields(method = %descriptor.full_name()))]
    pub async fn dispatch(
        &self,
        descriptor: &RpcDescriptor,
        virtual_storage: &VirtualStorage,
        repo: Option<&RepositoryId>,
        change: Option<ChangeKind>,
        new_relative_path: Option<String>,
        method_path: &str,
        body: Bytes,
    ) -> Result<Bytes, CoreError> {
        let route = self.router.route(descriptor, virtual_storage, repo).await?;
        match route {
            RouteOutcome::NonScoped { storage } => self.forward(virtual_storage, &storage, method_path, body).await,
            RouteOutcome::Accessor { storage } => self.forward(virtual_storage, &storage, method_path, body).await,
            RouteOutcome::Mutator { primary, secondaries, expected_generation } => {
                let repo = repo.ok_or_else(|| CoreError::internal("mutator routing returned without a repository"))?;
                let outcome = self.dispatch_mutator(repo, primary, secondaries, expected_generation, method_path, body).await?;
                Ok(outcome.primary_response)
            },
            RouteOutcome::Maintenance { primary, expected_generation } => {
                let repo = repo.ok_or_else(|| CoreError::internal("maintenance routing returned without a repository"))?;
                let change = change.ok_or_else(|| CoreError::internal("maintenance call dispatched without a change kind"))?;
                self.dispatch_maintenance(repo, &primary, expected_generation, change, new_relative_path, method_path, body).await
            },
        }
    }

    async fn forward(&self, virtual_storage: &VirtualStorage, storage: &StorageName, method_path: &str, body: Bytes) -> Result<Bytes, CoreError> {
        let endpoint = self.endpoint(virtual_storage, storage)?;
        self.backend
            .call_unary(endpoint, method_path, body)
            .await
            .map_err(|e| CoreError::Unavailable(format!("{storage}: {e}")))
    }

    /// The reference-transaction voting flow (spec.md §4.5 steps 1-8).
    async fn dispatch_mutator(
        &self,
        repo: &RepositoryId,
        primary: StorageName,
        secondaries: Vec<StorageName>,
        expected_generation: Generation,
        method_path: &str,
        body: Bytes,
    ) -> Result<MutatorOutcome, CoreError> {
        let _guard = self.lock_repo(repo).await;

        let participants: Vec<StorageName> = std::iter::once(primary.clone()).chain(secondaries.into_iter()).collect();
        let voters: Vec<Voter> = participants.iter().map(|s| Voter { name: s.0.clone(), weight: 1 }).collect();
        let threshold = self.vote_threshold(voters.len() as u32);
        let txn_id = self.registry.create(voters, threshold).map_err(|e| CoreError::internal(e.to_string()))?;

        let mut endpoints = Vec::with_capacity(participants.len());
        for storage in &participants {
            endpoints.push(self.endpoint(&repo.virtual_storage, storage)?.clone());
        }

        let calls = endpoints
            .iter()
            .map(|endpoint| self.backend.call_transactional(endpoint, method_path, body.clone(), txn_id, &self.coordinator_address));

        let results = match tokio::time::timeout(self.vote_timeout, futures::future::join_all(calls)).await {
            Ok(results) => results,
            Err(_) => {
                self.registry.cancel(txn_id);
                participants.iter().map(|_| Err(coord_backend::BackendError::Timeout)).collect()
            },
        };

        let mut applied = Vec::new();
        let mut primary_response = None;
        let mut primary_rpc_error = None;
        for (storage, result) in participants.iter().zip(results.into_iter()) {
            let committed = matches!(self.registry.participant_status(txn_id, &storage.0), Some(ParticipantStatus::Committed));
            match result {
                Ok(bytes) => {
                    if *storage == primary {
                        primary_response = Some(bytes);
                    }
                    if committed {
                        applied.push(storage.clone());
                    }
                },
                Err(e) => {
                    if *storage == primary {
                        primary_rpc_error = Some(e);
                    }
                },
            }
        }
        self.registry.cancel(txn_id);

        // Errors from the primary's own call always fail the client call
        // (spec.md §7), regardless of how any secondary voted.
        if let Some(e) = primary_rpc_error {
            return Err(CoreError::Unavailable(format!("primary {primary} failed: {e}")));
        }
        if applied.is_empty() {
            return Err(CoreError::Unavailable(format!("no participant applied the change for {repo}")));
        }

        let new_gen = self
            .datastore
            .increment_generation(repo, &applied, expected_generation)
            .await
            .map_err(|e| CoreError::datastore(e.to_string()))?;

        let source = if applied.contains(&primary) { primary.clone() } else { applied[0].clone() };
        let mut queued = Vec::new();
        for storage in participants.iter().filter(|s| !applied.contains(s)) {
            self.datastore
                .enqueue_replication(NewReplicationJob {
                    virtual_storage: repo.virtual_storage.clone(),
                    relative_path: repo.relative_path.clone(),
                    change: ChangeKind::Update,
                    source: Some(source.clone()),
                    target: storage.clone(),
                    source_generation_at_enqueue: Some(new_gen),
                    new_relative_path: None,
                })
                .await
                .map_err(|e| CoreError::datastore(e.to_string()))?;
            queued.push(storage.clone());
        }

        if !applied.contains(&primary) {
            return Err(CoreError::ReferenceUpdateAborted(format!(
                "primary {primary} did not commit; {} other participant(s) advanced ahead and replication was scheduled",
                applied.len()
            )));
        }

        Ok(MutatorOutcome {
            primary_response: primary_response.ok_or_else(|| CoreError::internal("primary applied the change without a captured response"))?,
            applied,
            queued_for_replication: queued,
        })
    }

    /// Maintenance mutators skip voting entirely: the primary runs the
    /// operation and every other known replica is caught up by a
    /// replication job (spec.md §4.4, §4.6).
    async fn dispatch_maintenance(
        &self,
        repo: &RepositoryId,
        primary: &StorageName,
        expected_generation: Generation,
        change: ChangeKind,
        new_relative_path: Option<String>,
        method_path: &str,
        body: Bytes,
    ) -> Result<Bytes, CoreError> {
        let _guard = self.lock_repo(repo).await;

        let endpoint = self.endpoint(&repo.virtual_storage, primary)?.clone();
        let response = self
            .backend
            .call_unary(&endpoint, method_path, body)
            .await
            .map_err(|e| CoreError::Unavailable(format!("primary {primary} failed: {e}")))?;

        let replicas = self.datastore.get_replicas(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        for (storage, _) in replicas {
            if storage == *primary {
                continue;
            }
            self.datastore
                .enqueue_replication(NewReplicationJob {
                    virtual_storage: repo.virtual_storage.clone(),
                    relative_path: repo.relative_path.clone(),
                    change,
                    source: Some(primary.clone()),
                    target: storage,
                    source_generation_at_enqueue: Some(expected_generation),
                    new_relative_path: new_relative_path.clone(),
                })
                .await
                .map_err(|e| CoreError::datastore(e.to_string()))?;
        }

        Ok(response)
    }

    /// Creation is special (spec.md §4.5): there is no prior generation to
    /// vote against, so the primary is simply materialized and elected,
    /// and every other assigned storage is caught up by a replication job.
    #[instrument(skip(self, body), fields(%repo))]
    pub async fn create_repository(
        &self,
        repo: &RepositoryId,
        primary: StorageName,
        assigned: Vec<StorageName>,
        method_path: &str,
        body: Bytes,
    ) -> Result<Bytes, CoreError> {
        let _guard = self.lock_repo(repo).await;

        let endpoint = self.endpoint(&repo.virtual_storage, &primary)?.clone();
        let response = self
            .backend
            .call_unary(&endpoint, method_path, body)
            .await
            .map_err(|e| CoreError::Unavailable(format!("primary {primary} failed to create the repository: {e}")))?;

        self.datastore
            .set_generation(repo, &primary, Generation(0))
            .await
            .map_err(|e| CoreError::datastore(e.to_string()))?;
        self.datastore
            .try_elect(repo, Some(primary.clone()), None)
            .await
            .map_err(|e| CoreError::datastore(e.to_string()))?;
        if !assigned.is_empty() {
            self.datastore
                .set_assignments(repo, Assignment { storages: assigned.clone() })
                .await
                .map_err(|e| CoreError::datastore(e.to_string()))?;
        }

        for storage in assigned.into_iter().filter(|s| *s != primary) {
            self.datastore
                .enqueue_replication(NewReplicationJob {
                    virtual_storage: repo.virtual_storage.clone(),
                    relative_path: repo.relative_path.clone(),
                    change: ChangeKind::Create,
                    source: Some(primary.clone()),
                    target: storage,
                    source_generation_at_enqueue: Some(Generation(0)),
                    new_relative_path: None,
                })
                .await
                .map_err(|e| CoreError::datastore(e.to_string()))?;
        }

        Ok(response)
    }

    /// Deletion is routed through the durable replication job queue like
    /// every other change kind (spec.md §4.5: "deletion enqueues
    /// `delete-replica` jobs for every storage, and the coordinator
    /// withholds election updates until all deletions complete or are
    /// dead"; §4.6). A `ChangeKind::DeleteReplica` job is enqueued for
    /// every known replica, inheriting that job kind's retry/backoff/
    /// dead-lettering from `ReplicationWorker`; the client sees the
    /// deletion as accepted once every job is durably queued, the same
    /// "not an error, work is scheduled" treatment the rest of §4.6 gives
    /// queued replication. `Datastore::complete_job` purges the
    /// repository's rows — including the election record — once the last
    /// `DeleteReplica` job for it reaches a terminal (`completed` or
    /// `dead`) state, which is what "withholds election updates" means in
    /// practice: no row survives to be re-elected into until deletion is
    /// fully resolved one way or the other.
    #[instrument(skip(self, _method_path, _body), fields(%repo))]
    pub async fn delete_repository(&self, repo: &RepositoryId, _method_path: &str, _body: Bytes) -> Result<Bytes, CoreError> {
        let _guard = self.lock_repo(repo).await;

        let replicas = self.datastore.get_replicas(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        if replicas.is_empty() {
            return Err(CoreError::NotFound(format!("{repo} has no known replicas")));
        }

        for (storage, _) in &replicas {
            self.datastore
                .enqueue_replication(NewReplicationJob {
                    virtual_storage: repo.virtual_storage.clone(),
                    relative_path: repo.relative_path.clone(),
                    change: ChangeKind::DeleteReplica,
                    source: None,
                    target: storage.clone(),
                    source_generation_at_enqueue: None,
                    new_relative_path: None,
                })
                .await
                .map_err(|e| CoreError::datastore(e.to_string()))?;
        }

        Ok(Bytes::new())
    }
}
