// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use coord_core::{
    Assignment,
    ChangeKind,
    DataLossAudit,
    ElectionRecord,
    Generation,
    HealthRecord,
    RepositoryId,
    ReplicationJob,
    StorageName,
    VirtualStorage,
};

use crate::error::DatastoreError;

/// A job not yet admitted to the queue. `EnqueueReplication` fills in the
/// id, state, and attempt count.
#[derive(Clone, Debug)]
pub struct NewReplicationJob {
    pub virtual_storage: VirtualStorage,
    pub relative_path: String,
    pub change: ChangeKind,
    pub source: Option<StorageName>,
    pub target: StorageName,
    pub source_generation_at_enqueue: Option<Generation>,
    /// For `change == Rename`: the relative path the repository moves to.
    pub new_relative_path: Option<String>,
}

/// Outcome a worker reports back through `CompleteJob`.
#[derive(Clone, Debug)]
pub enum JobResult {
    Completed,
    Failed { error: String, max_attempts: i32 },
}

/// Typed operations over the shared relational datastore (spec.md §4.1).
///
/// Implementations must make every method atomic: either the whole
/// operation is durably visible, or none of it is. `increment_generation`
/// and `try_elect` are optimistic-concurrency operations: they only apply
/// when the caller's expectation of current state still holds, and report
/// whether they did.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Idempotent: if an equivalent ready-or-in-progress job already
    /// exists for (virtual storage, relative path, change, target), return
    /// its id instead of creating a new one.
    async fn enqueue_replication(
        &self,
        job: NewReplicationJob,
    ) -> Result<(i64, bool), DatastoreError>;

    /// Pop the oldest ready job for `target` whose repository has no
    /// earlier in-progress job (FIFO per (repo, target), spec.md §3),
    /// atomically marking it in-progress and bumping its attempt count.
    async fn acquire_next_job(
        &self,
        virtual_storage: &VirtualStorage,
        target: &StorageName,
    ) -> Result<Option<ReplicationJob>, DatastoreError>;

    /// Marks `id` completed or failed/dead. For a completed job with
    /// `change == Rename`, every piece of keyed state for the old
    /// `(virtual storage, relative path)` — generations, assignments, the
    /// election record — is moved to `new_relative_path` atomically with
    /// the job completion (spec.md §9 open question 2), rather than left
    /// to be patched up lazily on next read.
    async fn complete_job(&self, id: i64, result: JobResult) -> Result<(), DatastoreError>;

    async fn get_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
    ) -> Result<Generation, DatastoreError>;

    /// Atomically move every storage in `participants` from `expected` to
    /// `max(current generations) + 1`, but only for storages whose current
    /// generation equals `expected`. Returns the new generation.
    async fn increment_generation(
        &self,
        repo: &RepositoryId,
        participants: &[StorageName],
        expected: Generation,
    ) -> Result<Generation, DatastoreError>;

    async fn set_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
        generation: Generation,
    ) -> Result<(), DatastoreError>;

    async fn get_replicas(
        &self,
        repo: &RepositoryId,
    ) -> Result<Vec<(StorageName, Generation)>, DatastoreError>;

    /// Every (repo, storage) pair whose generation trails the repository's
    /// authoritative generation.
    async fn list_outdated(&self) -> Result<Vec<RepositoryId>, DatastoreError>;

    /// Every repository the datastore currently has any row for (a
    /// generation, an assignment, or an election record). Used by the
    /// elector to drive a full election pass rather than only the
    /// generation-lagging subset `list_outdated` returns.
    async fn list_repositories(&self) -> Result<Vec<RepositoryId>, DatastoreError>;

    /// Count of replication jobs targeting `storage` currently sitting in
    /// `failed` or `dead` state, used by the elector to break ties between
    /// otherwise-equal candidates (spec.md §4.7). `ReplicationJob` carries
    /// no enqueue timestamp, so this is a present-tense count rather than
    /// a true bounded time window; jobs age out of it only when a later
    /// success (`complete_job(Completed)`) or a fresh enqueue clears them.
    async fn failed_job_count(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> Result<i64, DatastoreError>;

    async fn get_assignments(&self, repo: &RepositoryId) -> Result<Assignment, DatastoreError>;

    async fn set_assignments(
        &self,
        repo: &RepositoryId,
        assignment: Assignment,
    ) -> Result<(), DatastoreError>;

    async fn upsert_health(
        &self,
        coordinator_id: &str,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        seen_at_unix: i64,
    ) -> Result<(), DatastoreError>;

    /// True iff a strict majority of coordinators currently consider
    /// `storage` healthy.
    async fn consensus_healthy(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        healthy_window_secs: i64,
    ) -> Result<bool, DatastoreError>;

    async fn health_records(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
    ) -> Result<Vec<HealthRecord>, DatastoreError>;

    async fn get_election(
        &self,
        repo: &RepositoryId,
    ) -> Result<Option<ElectionRecord>, DatastoreError>;

    /// Optimistic: only succeeds if the stored primary still equals
    /// `expected_current`. Returns whether the election was applied.
    async fn try_elect(
        &self,
        repo: &RepositoryId,
        new_primary: Option<StorageName>,
        expected_current: Option<StorageName>,
    ) -> Result<bool, DatastoreError>;

    /// Purge all per-storage rows and queued replication jobs for a
    /// repository (called after a successful fanned-out delete).
    async fn delete_repository(&self, repo: &RepositoryId) -> Result<(), DatastoreError>;

    async fn record_data_loss_audit(&self, audit: DataLossAudit) -> Result<(), DatastoreError>;
}
