// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::instrument;

use coord_core::{CoreError, Generation, RepositoryId, RpcDescriptor, RpcKind, StorageName, VirtualStorage};
use coord_datastore::Datastore;
use coord_health::HealthTracker;

use crate::{outcome::RouteOutcome, topology::VirtualStorageTopology};

/// Classifies an incoming RPC and selects its primary/participant set
/// (spec.md §4.4). Reads a snapshot of election, generation, assignment,
/// and health state per call; it does not retry or re-read mid-decision.
pub struct Router {
    topologies: Vec<VirtualStorageTopology>,
    datastore: Arc<dyn Datastore>,
    health: Arc<HealthTracker>,
    round_robin: DashMap<VirtualStorage, AtomicUsize>,
    read_round_robin: DashMap<RepositoryId, AtomicUsize>,
}

impl Router {
    pub fn new(topologies: Vec<VirtualStorageTopology>, datastore: Arc<dyn Datastore>, health: Arc<HealthTracker>) -> Self {
        Self {
            topologies,
            datastore,
            health,
            round_robin: DashMap::new(),
            read_round_robin: DashMap::new(),
        }
    }

    fn topology(&self, virtual_storage: &VirtualStorage) -> Result<&VirtualStorageTopology, CoreError> {
        self.topologies
            .iter()
            .find(|t| &t.name == virtual_storage)
            .ok_or_else(|| CoreError::NotFound(format!("virtual storage {virtual_storage}")))
    }

    /// Route one call. `repo` must be `Some` for repository-scoped
    /// descriptors.
    #[instrument(skip(self, descriptor), fields(method = %descriptor.full_name()))]
    pub async fn route(
        &self,
        descriptor: &RpcDescriptor,
        virtual_storage: &VirtualStorage,
        repo: Option<&RepositoryId>,
    ) -> Result<RouteOutcome, CoreError> {
        if !descriptor.is_repository_scoped() {
            return Ok(RouteOutcome::NonScoped {
                storage: self.round_robin_storage(virtual_storage)?,
            });
        }

        let repo = repo.ok_or_else(|| {
            CoreError::InvalidRequest(format!("{} is repository-scoped but no repository field was given", descriptor.full_name()))
        })?;

        match descriptor.kind {
            RpcKind::Accessor => Ok(RouteOutcome::Accessor {
                storage: self.route_accessor(repo).await?,
            }),
            RpcKind::TransactionalMutator => self.route_mutator(repo).await,
            RpcKind::MaintenanceMutator => self.route_maintenance(repo).await,
        }
    }

    fn round_robin_storage(&self, virtual_storage: &VirtualStorage) -> Result<StorageName, CoreError> {
        let topology = self.topology(virtual_storage)?;
        if topology.storages.is_empty() {
            return Err(CoreError::NotFound(format!("no storages configured for {virtual_storage}")));
        }
        let counter = self.round_robin.entry(virtual_storage.clone()).or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % topology.storages.len();
        Ok(topology.storages[idx].clone())
    }

    async fn authoritative_generation(&self, repo: &RepositoryId) -> Result<Generation, CoreError> {
        let replicas = self.datastore.get_replicas(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        Ok(replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE))
    }

    /// spec.md §4.4: "the election record's primary if healthy and
    /// up-to-date; otherwise any cluster-healthy replica whose generation
    /// equals the authoritative generation."
    async fn route_accessor(&self, repo: &RepositoryId) -> Result<StorageName, CoreError> {
        let election = self.datastore.get_election(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let replicas = self.datastore.get_replicas(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let authoritative = replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE);

        if let Some(election) = &election {
            if !election.demoted {
                if let Some(primary) = &election.primary {
                    let primary_gen = replicas.iter().find(|(s, _)| s == primary).map(|(_, g)| *g).unwrap_or(Generation::NONE);
                    if primary_gen == authoritative && self.health.is_healthy(&repo.virtual_storage, primary).await {
                        return Ok(primary.clone());
                    }
                }
            }
        }

        let candidates: Vec<&StorageName> = {
            let mut out = Vec::new();
            for (storage, generation) in &replicas {
                if *generation == authoritative && self.health.is_healthy(&repo.virtual_storage, storage).await {
                    out.push(storage);
                }
            }
            out
        };
        if candidates.is_empty() {
            return Err(CoreError::RepositoryReadOnly);
        }
        let counter = self.read_round_robin.entry(repo.clone()).or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[idx].clone())
    }

    /// spec.md §4.4: "the primary plus every cluster-healthy, up-to-date,
    /// assigned secondary."
    async fn route_mutator(&self, repo: &RepositoryId) -> Result<RouteOutcome, CoreError> {
        let election = self.datastore.get_election(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let primary = election
            .as_ref()
            .filter(|e| !e.demoted)
            .and_then(|e| e.primary.clone())
            .ok_or(CoreError::NoPrimary)?;

        if !self.health.is_healthy(&repo.virtual_storage, &primary).await {
            return Err(CoreError::NoPrimary);
        }

        let replicas = self.datastore.get_replicas(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let authoritative = replicas.iter().map(|(_, g)| *g).max().unwrap_or(Generation::NONE);
        let primary_gen = replicas.iter().find(|(s, _)| *s == primary).map(|(_, g)| *g).unwrap_or(Generation::NONE);
        if primary_gen != authoritative {
            return Err(CoreError::NoPrimary);
        }

        let assignment = self.datastore.get_assignments(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let mut secondaries = Vec::new();
        for (storage, generation) in &replicas {
            if *storage == primary || *generation != authoritative || !assignment.permits(storage) {
                continue;
            }
            if self.health.is_healthy(&repo.virtual_storage, storage).await {
                secondaries.push(storage.clone());
            }
        }

        Ok(RouteOutcome::Mutator {
            primary,
            secondaries,
            expected_generation: authoritative,
        })
    }

    /// spec.md §4.4: maintenance mutators are "routed to the primary only
    /// and always produce replication jobs for secondaries instead of
    /// using transactions."
    async fn route_maintenance(&self, repo: &RepositoryId) -> Result<RouteOutcome, CoreError> {
        let election = self.datastore.get_election(repo).await.map_err(|e| CoreError::datastore(e.to_string()))?;
        let primary = election
            .as_ref()
            .filter(|e| !e.demoted)
            .and_then(|e| e.primary.clone())
            .ok_or(CoreError::NoPrimary)?;
        if !self.health.is_healthy(&repo.virtual_storage, &primary).await {
            return Err(CoreError::NoPrimary);
        }
        let expected_generation = self.authoritative_generation(repo).await?;
        Ok(RouteOutcome::Maintenance { primary, expected_generation })
    }
}
