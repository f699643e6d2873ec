// SPDX-License-Identifier: Apache-2.0

use coord_core::{Generation, StorageName};

/// What the router decided to do with one call (spec.md §4.4).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    /// Not addressed at a particular repository: one storage, picked
    /// round-robin.
    NonScoped { storage: StorageName },
    /// A repository-scoped accessor: the primary if healthy and
    /// up-to-date, otherwise any cluster-healthy replica at the
    /// authoritative generation.
    Accessor { storage: StorageName },
    /// A repository-scoped transactional mutator: the primary plus every
    /// cluster-healthy, up-to-date, assigned secondary.
    Mutator {
        primary: StorageName,
        secondaries: Vec<StorageName>,
        /// Authoritative generation observed at routing time; the caller
        /// passes this back to `IncrementGeneration` as the expected
        /// current generation (spec.md §4.1).
        expected_generation: Generation,
    },
    /// A maintenance mutator (repack, gc, write-commit-graph, pack-refs):
    /// routed to the primary only, secondaries are reconciled by
    /// replication job rather than vote (spec.md §4.4).
    Maintenance {
        primary: StorageName,
        expected_generation: Generation,
    },
}
