// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("datastore error: {0}")]
    Datastore(#[from] coord_datastore::DatastoreError),
}
