// SPDX-License-Identifier: Apache-2.0

//! The router (spec.md §4.4) classifies every incoming call from a small,
//! statically-known descriptor rather than fully-typed generated stubs
//! (spec.md §9: "generate per-method dispatchers from the service
//! descriptor; the core design is unchanged"). `RpcDescriptor` is that
//! descriptor.

use serde::{Deserialize, Serialize};

/// Accessor (read-only) vs. mutator (state-changing) RPC.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RpcKind {
    Accessor,
    /// A mutator that participates in the transactional voting path.
    TransactionalMutator,
    /// A mutator whose effects are replicated by job rather than vote
    /// (repack, gc, write-commit-graph, pack-refs; spec.md §4.4).
    MaintenanceMutator,
}

impl RpcKind {
    pub fn is_mutator(&self) -> bool {
        !matches!(self, RpcKind::Accessor)
    }
}

/// Where, inside the request message, the repository field lives. The
/// coordinator only ever needs the resolved string value; extracting it
/// from the wire message is the concern of the transport layer that reads
/// the compiled descriptors (spec.md §6), not of the router itself.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoFieldPath(pub String);

/// Whether a call is scoped to a single repository at all.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RpcScope {
    /// Not addressed at a particular repository (e.g. a storage-level
    /// listing call).
    NonScoped,
    /// Addressed at exactly one repository, found at `field`.
    RepositoryScoped { field: RepoFieldPath },
}

/// Static description of one RPC method, analogous to the annotations the
/// reference schema carries on its compiled descriptors (spec.md §6).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RpcDescriptor {
    pub service: String,
    pub method: String,
    pub kind: RpcKind,
    pub scope: RpcScope,
}

impl RpcDescriptor {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    pub fn is_repository_scoped(&self) -> bool {
        matches!(self.scope, RpcScope::RepositoryScoped { .. })
    }
}
