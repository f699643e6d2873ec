// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use coord_core::{StorageName, VirtualStorage};

use crate::client::Endpoint;
use crate::error::BackendError;

/// Static, configuration-derived mapping from a physical storage to the
/// address the coordinator dials to reach it. Shared by every crate that
/// needs to turn a `(virtual storage, storage)` pair into something
/// [`crate::BackendClient`] can dial.
#[derive(Clone, Debug, Default)]
pub struct EndpointTable {
    entries: HashMap<(VirtualStorage, StorageName), Endpoint>,
}

impl EndpointTable {
    pub fn new(entries: HashMap<(VirtualStorage, StorageName), Endpoint>) -> Self {
        Self { entries }
    }

    pub fn get(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> Result<&Endpoint, BackendError> {
        self.entries
            .get(&(virtual_storage.clone(), storage.clone()))
            .ok_or_else(|| BackendError::UnknownEndpoint(format!("{virtual_storage}/{storage}")))
    }
}
