// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Client-visible error taxonomy (spec.md §7). Every error the core
/// surfaces to a caller is one of these kinds; transport crates translate
/// a `CoreError` into their own status type (e.g. `tonic::Status`) at the
/// boundary rather than inventing new categories.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("repository is read-only: no primary is currently eligible")]
    RepositoryReadOnly,

    #[error("no primary is currently available to dispatch the mutator")]
    NoPrimary,

    #[error("reference update aborted: {0}")]
    ReferenceUpdateAborted(String),

    #[error("all participants unreachable or timed out: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] Internal),
}

/// Internal failures: datastore errors, bugs, unexpected state. Distinct
/// from the public taxonomy so call sites can attach a `#[source]` without
/// growing [`CoreError`]'s match arms.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Internal {
    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("unexpected state: {0}")]
    UnexpectedState(String),
}

impl CoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(Internal::UnexpectedState(msg.into()))
    }

    pub fn datastore(msg: impl Into<String>) -> Self {
        Self::Internal(Internal::Datastore(msg.into()))
    }
}
