// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("backend call timed out")]
    Timeout,

    #[error("backend returned an error: {0}")]
    Status(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid method path {0}")]
    InvalidPath(String),

    #[error("no endpoint configured for {0}")]
    UnknownEndpoint(String),
}
