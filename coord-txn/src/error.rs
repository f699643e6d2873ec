// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors the registry itself can report (spec.md §4.3). Distinct from
/// [`coord_core::CoreError`]: these are programming/protocol errors raised
/// by the registry's own API, not the client-visible taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("threshold {threshold} out of range [{min}, {total}] for {total} total voter weight")]
    InvalidParameters {
        threshold: u32,
        min: u32,
        total: u32,
    },

    #[error("no such transaction: {0}")]
    UnknownTransaction(u32),

    #[error("voter {0} is not registered for this transaction")]
    UnknownVoter(String),
}
