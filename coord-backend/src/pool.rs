// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};

use crate::{client::Endpoint, error::BackendError};

/// Process-wide connection pool keyed by `(address, token)` (spec.md §5):
/// a shared channel that outlives any single call and is reused across
/// concurrent RPCs to the same storage.
#[derive(Default)]
pub struct ConnectionPool {
    channels: DashMap<(String, String), Channel>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, endpoint: &Endpoint) -> Result<Channel, BackendError> {
        let key = (endpoint.address.clone(), endpoint.token.clone());
        if let Some(channel) = self.channels.get(&key) {
            return Ok(channel.clone());
        }

        let tonic_endpoint = TonicEndpoint::from_shared(endpoint.address.clone())
            .map_err(|e| BackendError::Connect {
                address: endpoint.address.clone(),
                source: e,
            })?
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Some(Duration::from_secs(30)));

        let channel = tonic_endpoint
            .connect()
            .await
            .map_err(|e| BackendError::Connect {
                address: endpoint.address.clone(),
                source: e,
            })?;

        self.channels.insert(key, channel.clone());
        Ok(channel)
    }
}
