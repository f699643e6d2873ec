// SPDX-License-Identifier: Apache-2.0

//! Client-side stubs and connection pooling for the backend repository
//! service (spec.md §6): the per-replica Git RPC service the coordinator
//! proxies calls to, plus the additional replication-only RPCs
//! (`ReplicateRepository`, `GetSnapshot`, `CreateRepositoryFromSnapshot`,
//! `GetConfig`, `GetInfoAttributes`).

mod client;
mod codec;
mod endpoints;
mod error;
mod pool;

pub use client::{BackendClient, Endpoint, GrpcBackendClient, SnapshotChunk, SnapshotStream};
pub use endpoints::EndpointTable;
pub use error::BackendError;
pub use pool::ConnectionPool;
