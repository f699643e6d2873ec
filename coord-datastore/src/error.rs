// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Every datastore operation either succeeds atomically or returns one of
/// these (spec.md §4.1). Callers retry [`DatastoreError::Transient`] with
/// backoff and abort on [`DatastoreError::Permanent`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatastoreError {
    #[error("transient datastore error: {0}")]
    Transient(String),

    #[error("schema or constraint violation: {0}")]
    Permanent(String),

    #[error("no such row: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatastoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => DatastoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                DatastoreError::Permanent(e.to_string())
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                DatastoreError::Transient(e.to_string())
            },
            _ => DatastoreError::Transient(e.to_string()),
        }
    }
}
