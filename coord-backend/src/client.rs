// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use coord_core::{ChangeKind, RepositoryId};

use crate::{codec::BytesCodec, error::BackendError, pool::ConnectionPool};

/// Address and auth token for one storage, supplied by configuration
/// (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub token: String,
}

pub type SnapshotChunk = Result<Bytes, BackendError>;
pub type SnapshotStream = Pin<Box<dyn Stream<Item = SnapshotChunk> + Send>>;

/// Client-side surface of the backend repository service (spec.md §6),
/// plus the generic pass-through used by the proxy for client-facing
/// methods it does not otherwise model (spec.md §9).
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// A trivial accessor call with a short deadline, used by the health
    /// tracker (spec.md §4.2).
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> Result<(), BackendError>;

    async fn replicate_repository(
        &self,
        endpoint: &Endpoint,
        source: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<(), BackendError>;

    async fn get_snapshot(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<SnapshotStream, BackendError>;

    async fn create_repository_from_snapshot(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        data: SnapshotStream,
    ) -> Result<(), BackendError>;

    async fn get_config(&self, endpoint: &Endpoint, repo: &RepositoryId) -> Result<Bytes, BackendError>;

    async fn get_info_attributes(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<Bytes, BackendError>;

    async fn rename(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        new_relative_path: &str,
    ) -> Result<(), BackendError>;

    async fn delete(&self, endpoint: &Endpoint, repo: &RepositoryId) -> Result<(), BackendError>;

    async fn maintenance(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        kind: ChangeKind,
    ) -> Result<(), BackendError>;

    /// Generic unary forwarding for client-facing methods the coordinator
    /// proxies without a typed stub (spec.md §9).
    async fn call_unary(
        &self,
        endpoint: &Endpoint,
        method_path: &str,
        body: Bytes,
    ) -> Result<Bytes, BackendError>;

    /// Like [`Self::call_unary`], but for a call that participates in
    /// reference-transaction voting: `transaction_id` and
    /// `coordinator_address` are attached as request metadata so the
    /// replica's hook can call back into `VoteTransaction` (spec.md §6,
    /// §9). The default implementation has no metadata channel available
    /// and just forwards to `call_unary`; fakes that simulate the hook
    /// override it directly.
    async fn call_transactional(
        &self,
        endpoint: &Endpoint,
        method_path: &str,
        body: Bytes,
        transaction_id: u32,
        coordinator_address: &str,
    ) -> Result<Bytes, BackendError> {
        let _ = (transaction_id, coordinator_address);
        self.call_unary(endpoint, method_path, body).await
    }
}

/// `tonic`-backed [`BackendClient`]. Requests are dispatched through
/// `tonic::client::Grpc` directly against a method path and the
/// pass-through [`BytesCodec`], rather than through generated per-RPC
/// stubs, since the backend's `.proto` schema lives outside this crate's
/// compilation unit (spec.md §9).
pub struct GrpcBackendClient {
    pool: ConnectionPool,
}

impl Default for GrpcBackendClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcBackendClient {
    pub fn new() -> Self {
        Self {
            pool: ConnectionPool::new(),
        }
    }

    async fn grpc(&self, endpoint: &Endpoint) -> Result<tonic::client::Grpc<tonic::transport::Channel>, BackendError> {
        let channel = self.pool.get(endpoint).await?;
        let mut client = tonic::client::Grpc::new(channel);
        client
            .ready()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(client)
    }

    fn authed_request(endpoint: &Endpoint, body: Bytes) -> tonic::Request<Bytes> {
        let mut req = tonic::Request::new(body);
        if let Ok(value) = endpoint.token.parse() {
            req.metadata_mut().insert("authorization", value);
        }
        req
    }

    async fn unary(&self, endpoint: &Endpoint, path: &str, body: Bytes) -> Result<Bytes, BackendError> {
        let mut client = self.grpc(endpoint).await?;
        let path = http::uri::PathAndQuery::from_str(path)
            .map_err(|_| BackendError::InvalidPath(path.to_string()))?;
        let response = client
            .unary(Self::authed_request(endpoint, body), path, BytesCodec)
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl BackendClient for GrpcBackendClient {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> Result<(), BackendError> {
        tokio::time::timeout(deadline, self.unary(endpoint, "/repo.v1.RepositoryService/Exists", Bytes::new()))
            .await
            .map_err(|_| BackendError::Timeout)??;
        Ok(())
    }

    async fn replicate_repository(
        &self,
        endpoint: &Endpoint,
        source: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<(), BackendError> {
        let body = format!("{}\u{0}{}\u{0}{}", source.address, repo.virtual_storage, repo.relative_path);
        self.unary(
            endpoint,
            "/repo.v1.RepositoryService/ReplicateRepository",
            Bytes::from(body),
        )
        .await?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<SnapshotStream, BackendError> {
        let mut client = self.grpc(endpoint).await?;
        let path = http::uri::PathAndQuery::from_str("/repo.v1.RepositoryService/GetSnapshot")
            .expect("static path is valid");
        let body = Bytes::from(format!("{}\u{0}{}", repo.virtual_storage, repo.relative_path));
        let response = client
            .server_streaming(Self::authed_request(endpoint, body), path, BytesCodec)
            .await?;
        let stream = response.into_inner();
        Ok(Box::pin(futures::StreamExt::map(stream, |item| {
            item.map_err(BackendError::from)
        })))
    }

    async fn create_repository_from_snapshot(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        mut data: SnapshotStream,
    ) -> Result<(), BackendError> {
        use futures::StreamExt as _;

        let header = Bytes::from(format!("{}\u{0}{}\u{0}", repo.virtual_storage, repo.relative_path));
        let mut client = self.grpc(endpoint).await?;
        let path = http::uri::PathAndQuery::from_str("/repo.v1.RepositoryService/CreateRepositoryFromSnapshot")
            .expect("static path is valid");

        let outbound = async_stream::stream! {
            yield header;
            while let Some(chunk) = data.next().await {
                match chunk {
                    Ok(bytes) => yield bytes,
                    Err(_) => break,
                }
            }
        };

        let mut request = tonic::Request::new(outbound);
        if let Ok(value) = endpoint.token.parse() {
            request.metadata_mut().insert("authorization", value);
        }

        client.client_streaming(request, path, BytesCodec).await?;
        Ok(())
    }

    async fn get_config(&self, endpoint: &Endpoint, repo: &RepositoryId) -> Result<Bytes, BackendError> {
        let body = Bytes::from(format!("{}\u{0}{}", repo.virtual_storage, repo.relative_path));
        self.unary(endpoint, "/repo.v1.RepositoryService/GetConfig", body).await
    }

    async fn get_info_attributes(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
    ) -> Result<Bytes, BackendError> {
        let body = Bytes::from(format!("{}\u{0}{}", repo.virtual_storage, repo.relative_path));
        self.unary(endpoint, "/repo.v1.RepositoryService/GetInfoAttributes", body)
            .await
    }

    async fn rename(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        new_relative_path: &str,
    ) -> Result<(), BackendError> {
        let body = Bytes::from(format!(
            "{}\u{0}{}\u{0}{}",
            repo.virtual_storage, repo.relative_path, new_relative_path
        ));
        self.unary(endpoint, "/repo.v1.RepositoryService/RenameRepository", body)
            .await?;
        Ok(())
    }

    async fn delete(&self, endpoint: &Endpoint, repo: &RepositoryId) -> Result<(), BackendError> {
        let body = Bytes::from(format!("{}\u{0}{}", repo.virtual_storage, repo.relative_path));
        self.unary(endpoint, "/repo.v1.RepositoryService/RemoveRepository", body)
            .await?;
        Ok(())
    }

    async fn maintenance(
        &self,
        endpoint: &Endpoint,
        repo: &RepositoryId,
        kind: ChangeKind,
    ) -> Result<(), BackendError> {
        let method = match kind {
            ChangeKind::GarbageCollect => "GarbageCollect",
            ChangeKind::RepackFull => "RepackFull",
            ChangeKind::RepackIncremental => "RepackIncremental",
            ChangeKind::WriteCommitGraph => "WriteCommitGraph",
            ChangeKind::PackRefs => "PackRefs",
            other => {
                return Err(BackendError::InvalidPath(format!(
                    "{other:?} is not a maintenance operation"
                )))
            },
        };
        let body = Bytes::from(format!("{}\u{0}{}", repo.virtual_storage, repo.relative_path));
        self.unary(endpoint, &format!("/repo.v1.RepositoryMaintenanceService/{method}"), body)
            .await?;
        Ok(())
    }

    async fn call_unary(
        &self,
        endpoint: &Endpoint,
        method_path: &str,
        body: Bytes,
    ) -> Result<Bytes, BackendError> {
        self.unary(endpoint, method_path, body).await
    }

    async fn call_transactional(
        &self,
        endpoint: &Endpoint,
        method_path: &str,
        body: Bytes,
        transaction_id: u32,
        coordinator_address: &str,
    ) -> Result<Bytes, BackendError> {
        let mut client = self.grpc(endpoint).await?;
        let path = http::uri::PathAndQuery::from_str(method_path)
            .map_err(|_| BackendError::InvalidPath(method_path.to_string()))?;
        let mut request = Self::authed_request(endpoint, body);
        if let Ok(value) = transaction_id.to_string().parse() {
            request.metadata_mut().insert("x-coord-transaction-id", value);
        }
        if let Ok(value) = coordinator_address.parse() {
            request.metadata_mut().insert("x-coord-callback-address", value);
        }
        let response = client.unary(request, path, BytesCodec).await?;
        Ok(response.into_inner())
    }
}
