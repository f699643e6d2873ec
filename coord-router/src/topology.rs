// SPDX-License-Identifier: Apache-2.0

use coord_core::{StorageName, VirtualStorage};

/// The configured member storages of one virtual storage (spec.md §3). The
/// router consults this for non-repository-scoped calls, which have no
/// election record to read a primary from.
#[derive(Clone, Debug)]
pub struct VirtualStorageTopology {
    pub name: VirtualStorage,
    pub storages: Vec<StorageName>,
}

impl VirtualStorageTopology {
    pub fn new(name: VirtualStorage, storages: Vec<StorageName>) -> Self {
        Self { name, storages }
    }
}
