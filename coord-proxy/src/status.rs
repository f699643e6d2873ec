// SPDX-License-Identifier: Apache-2.0

use tonic::Status;

use coord_core::CoreError;

/// Translate the client-visible error taxonomy into a gRPC status, the way
/// every transport boundary in this system is expected to (spec.md §7:
/// "transport crates translate a `CoreError` into their own status type at
/// the boundary rather than inventing new categories").
pub fn to_status(err: CoreError) -> Status {
    match err {
        CoreError::InvalidRequest(msg) => Status::invalid_argument(msg),
        CoreError::NotFound(msg) => Status::not_found(msg),
        CoreError::RepositoryReadOnly => Status::failed_precondition(err.to_string()),
        CoreError::NoPrimary => Status::unavailable(err.to_string()),
        CoreError::ReferenceUpdateAborted(msg) => Status::aborted(msg),
        CoreError::Unavailable(msg) => Status::unavailable(msg),
        CoreError::Internal(_) => Status::internal(err.to_string()),
        // CoreError is #[non_exhaustive]; future variants surface as
        // generic failures rather than failing to compile here.
        _ => Status::unknown(err.to_string()),
    }
}
