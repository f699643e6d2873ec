// SPDX-License-Identifier: Apache-2.0

//! Shared types for the replication coordinator: the virtual-storage data
//! model (§3), the RPC descriptor table used by the router (§4.4), and the
//! client-visible error taxonomy (§7).

pub mod descriptor;
pub mod error;
pub mod model;

pub use descriptor::{RepoFieldPath, RpcDescriptor, RpcKind, RpcScope};
pub use error::CoreError;
pub use model::{
    Assignment,
    ChangeKind,
    DataLossAudit,
    ElectionRecord,
    Generation,
    HealthRecord,
    JobState,
    RepositoryId,
    ReplicationJob,
    StorageName,
    VirtualStorage,
};
