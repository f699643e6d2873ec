// SPDX-License-Identifier: Apache-2.0

//! Reference-transaction voting registry (spec.md §4.3): in-memory,
//! process-local bookkeeping for the votes cast by replicas as their Git
//! reference-transaction hooks run, reachable through
//! [`Registry::vote`]/[`Registry::create`]/[`Registry::cancel`]. Transport
//! crates (`coord-proxy`) expose `Registry::vote` as the `VoteTransaction`
//! RPC the hook calls back into (spec.md §6, §9).

mod error;
mod registry;
mod transaction;

pub use error::RegistryError;
pub use registry::Registry;
pub use transaction::{Outcome, ParticipantStatus, VoteHash, Voter};
