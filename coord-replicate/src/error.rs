// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use coord_core::ChangeKind;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplicateError {
    #[error("backend error: {0}")]
    Backend(#[from] coord_backend::BackendError),

    #[error("datastore error: {0}")]
    Datastore(#[from] coord_datastore::DatastoreError),

    #[error("replication job for {0} has no source storage")]
    MissingSource(String),

    #[error("rename job for {0} has no target relative path")]
    MissingRenameTarget(String),

    #[error("{0:?} is not a change kind the replication worker can apply")]
    UnsupportedChangeKind(ChangeKind),
}
