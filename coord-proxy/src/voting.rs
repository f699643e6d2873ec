// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tonic::{Request, Response, Status};

use coord_txn::{Outcome, Registry};

use crate::proto::vote_response::Outcome as WireOutcome;
use crate::proto::voting_service_server::VotingService;
use crate::proto::{VoteRequest, VoteResponse};

/// The `VotingService` endpoint the reference-transaction hook calls back
/// into (spec.md §4.3, §6, §9). A thin wrapper: all of the actual
/// bookkeeping lives in [`coord_txn::Registry`].
pub struct VotingEndpoint {
    registry: Arc<Registry>,
}

impl VotingEndpoint {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl VotingService for VotingEndpoint {
    async fn vote_transaction(&self, request: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        if req.reference_hash.len() != 20 {
            return Err(Status::invalid_argument("reference_hash must be exactly 20 bytes"));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&req.reference_hash);

        let outcome = self
            .registry
            .vote(req.transaction_id, &req.voter_name, hash)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?;

        let wire = match outcome {
            Outcome::Commit => WireOutcome::Commit,
            Outcome::Abort => WireOutcome::Abort,
            Outcome::Stop => WireOutcome::Stop,
        };
        Ok(Response::new(VoteResponse { outcome: wire as i32 }))
    }
}
