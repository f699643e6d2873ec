// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// A client-visible namespace aggregating a set of physical storages.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct VirtualStorage(pub String);

impl fmt::Display for VirtualStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The name of a physical storage (backend replica) within a virtual
/// storage. Uniquely identifies a node together with its [`VirtualStorage`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct StorageName(pub String);

impl fmt::Display for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A repository is identified by (virtual storage, relative path).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RepositoryId {
    pub virtual_storage: VirtualStorage,
    pub relative_path: String,
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.virtual_storage, self.relative_path)
    }
}

/// Per-(repository, storage) generation number. `NONE` is the sentinel
/// meaning "no copy known to exist here" (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Generation(pub i64);

impl Generation {
    pub const NONE: Generation = Generation(-1);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn next(&self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Explicit subset of storages designated to hold a repository. An empty
/// set means "all storages in the virtual storage are eligible."
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub storages: Vec<StorageName>,
}

impl Assignment {
    pub fn is_restricted(&self) -> bool {
        !self.storages.is_empty()
    }

    pub fn permits(&self, storage: &StorageName) -> bool {
        !self.is_restricted() || self.storages.contains(storage)
    }
}

/// Kind of work a replication job performs (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Update,
    Create,
    DeleteReplica,
    Rename,
    GarbageCollect,
    RepackFull,
    RepackIncremental,
    WriteCommitGraph,
    PackRefs,
}

impl ChangeKind {
    /// Maintenance kinds are always routed to the primary and always
    /// replicate via a job rather than a transaction (spec.md §4.4).
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            ChangeKind::GarbageCollect
                | ChangeKind::RepackFull
                | ChangeKind::RepackIncremental
                | ChangeKind::WriteCommitGraph
                | ChangeKind::PackRefs
        )
    }
}

/// Lifecycle state of a replication job (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InProgress,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

/// A durable record of work needed to bring a target replica to parity
/// with a source (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub id: i64,
    pub virtual_storage: VirtualStorage,
    pub relative_path: String,
    pub change: ChangeKind,
    pub source: Option<StorageName>,
    pub target: StorageName,
    pub attempt: i32,
    pub state: JobState,
    pub last_error: Option<String>,
    /// Source generation captured at enqueue time; used to set the
    /// target's generation on success (spec.md §4.6).
    pub source_generation_at_enqueue: Option<Generation>,
    /// For `change == Rename`: the relative path the repository moves to.
    /// The datastore updates the election record's path in the same
    /// operation that completes the job (spec.md §9 open question 2).
    pub new_relative_path: Option<String>,
}

impl ReplicationJob {
    pub fn repo(&self) -> RepositoryId {
        RepositoryId {
            virtual_storage: self.virtual_storage.clone(),
            relative_path: self.relative_path.clone(),
        }
    }
}

/// Per-(coordinator, virtual storage, storage) liveness entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthRecord {
    pub coordinator_id: String,
    pub virtual_storage: VirtualStorage,
    pub storage: StorageName,
    pub last_seen_unix: i64,
}

/// Per-repository election state (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub repo: RepositoryId,
    pub primary: Option<StorageName>,
    pub demoted: bool,
    pub elected_at_unix: i64,
}

impl ElectionRecord {
    pub fn read_only(repo: RepositoryId, now_unix: i64) -> Self {
        Self {
            repo,
            primary: None,
            demoted: true,
            elected_at_unix: now_unix,
        }
    }
}

/// Record of an operator accepting data loss on a storage by promoting an
/// out-of-date replica (spec.md §3 Supplement).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataLossAudit {
    pub repo: RepositoryId,
    pub storage: StorageName,
    pub accepted_generation: Generation,
    pub previous_generation: Generation,
    pub operator: String,
    pub at_unix: i64,
    pub reason: String,
}
