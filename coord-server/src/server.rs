// SPDX-License-Identifier: Apache-2.0

//! Wires the library crates into a running process (SPEC_FULL.md §1
//! "Process shape"): opens the datastore pool, starts the health
//! prober, the elector, the reconciler, the replication worker pools, and
//! the `VoteTransaction` listener the replica-side hook calls back into,
//! then shuts them all down cleanly on signal.
//!
//! The client-facing RPC surface itself (spec.md §6: "an RPC service
//! identical in schema to the backend repository service") is an
//! external collaborator whose `.proto` this workspace does not compile
//! against (spec.md §1); [`coord_proxy::Coordinator::dispatch`] is ready
//! to serve it the moment a concrete schema is wired in via
//! `tonic::codegen`, but no such frontend listener is bound here.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use coord_backend::{BackendClient, GrpcBackendClient};
use coord_core::{StorageName, VirtualStorage};
use coord_datastore::{Datastore, PgDatastore};
use coord_elect::Elector;
use coord_health::{HealthTracker, ProbeTarget};
use coord_proxy::{Coordinator, VotingEndpoint, VotingServiceServer};
use coord_reconcile::Reconciler;
use coord_replicate::{ReplicationPool, ReplicationPoolConfig};
use coord_router::Router;
use coord_rt::Spawner;
use coord_txn::Registry;

use crate::config::Config;

/// Everything the process needs for the lifetime of one run. Held by
/// [`run`] only long enough to join every subsystem on shutdown.
pub struct Server {
    pub coordinator: Arc<Coordinator>,
    pub health: Arc<HealthTracker>,
    pub datastore: Arc<dyn Datastore>,
    tasks: Vec<coord_rt::Task<()>>,
}

/// Builds every subsystem from `config` and starts their background
/// loops. `coordinator_address` is the address this process's
/// `VoteTransaction` listener is reachable at; it is what gets
/// propagated to replicas via RPC metadata (spec.md §4.3, §9) so their
/// reference-transaction hooks know where to call back. The caller
/// drives `shutdown` (typically from [`crate::signals::routine`]) and
/// then awaits [`Server::joined`].
pub async fn build(config: &Config, coordinator_id: &str, coordinator_address: &str, shutdown: watch::Receiver<bool>) -> Result<Server> {
    let pg = PgDatastore::connect(&config.datastore_url, config.datastore_max_connections)
        .await
        .context("failed to connect to the datastore")?;
    pg.migrate().await.context("failed to run datastore migrations")?;
    let datastore: Arc<dyn Datastore> = Arc::new(pg);

    let backend: Arc<dyn BackendClient> = Arc::new(GrpcBackendClient::new());
    let endpoints = config.endpoint_table();
    let spawner = Spawner::from_current().context("coord-server must run inside a tokio runtime")?;

    let health = Arc::new(HealthTracker::new(
        coordinator_id,
        Arc::clone(&datastore),
        Arc::clone(&backend),
        config.probe_interval(),
        config.probe_deadline(),
        config.healthy_window(),
        config.health_cache_ttl(),
    ));

    let probe_targets = probe_targets(config);
    let health_task = {
        let health = Arc::clone(&health);
        let shutdown = shutdown.clone();
        spawner.spawn(async move { health.run(probe_targets, shutdown).await })
    };

    let router = Arc::new(Router::new(config.topologies(), Arc::clone(&datastore), Arc::clone(&health)));
    let registry = Arc::new(Registry::new());
    let coordinator = Arc::new(Coordinator::with_vote_tolerance(
        Arc::clone(&router),
        Arc::clone(&registry),
        Arc::clone(&datastore),
        Arc::clone(&backend),
        endpoints.clone(),
        config.vote_timeout(),
        coordinator_address.to_string(),
        config.max_tolerated_vote_failures,
    ));

    let elector = Arc::new(Elector::new(Arc::clone(&datastore), Arc::clone(&health), config.election_failed_job_window()));
    let elect_task = {
        let elector = Arc::clone(&elector);
        let ds = Arc::clone(&datastore);
        let shutdown = shutdown.clone();
        let interval = config.election_interval();
        spawner.spawn(async move {
            elector
                .run(move || coord_elect::datastore_catalog(Arc::clone(&ds)), interval, shutdown)
                .await
        })
    };

    let reconciler = Arc::new(Reconciler::new(Arc::clone(&datastore)));
    let reconcile_task = {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        let interval = config.reconcile_interval();
        spawner.spawn(async move { reconciler.run(interval, shutdown).await })
    };

    let targets = all_targets(config);
    let replicate_config = ReplicationPoolConfig {
        workers_per_target: config.replication_workers_per_target,
        max_attempts: config.max_replication_attempts,
        poll_interval: std::time::Duration::from_millis(config.replication_poll_interval_ms),
        backoff_base: std::time::Duration::from_millis(config.replication_backoff_base_ms),
    };
    let replicate_pool = ReplicationPool::spawn(
        &spawner,
        endpoints,
        Arc::clone(&datastore),
        Arc::clone(&backend),
        targets,
        replicate_config,
        shutdown.clone(),
    );
    let replicate_task = spawner.spawn(async move { replicate_pool.joined().await });

    Ok(Server {
        coordinator,
        health,
        datastore,
        tasks: vec![health_task, elect_task, reconcile_task, replicate_task],
    })
}

impl Server {
    /// Waits for every spawned subsystem to observe shutdown and return.
    pub async fn joined(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Starts the `VoteTransaction` listener the reference-transaction hook
/// calls back into (spec.md §4.3, §6, §9), bound to `listen_addr`.
pub async fn serve_voting(coordinator: &Coordinator, listen_addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let endpoint = VotingEndpoint::new(coordinator.registry());
    info!(%listen_addr, "starting VoteTransaction listener");
    tonic::transport::Server::builder()
        .add_service(VotingServiceServer::new(endpoint))
        .serve_with_shutdown(listen_addr, async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("VoteTransaction listener failed")?;
    Ok(())
}

fn probe_targets(config: &Config) -> Vec<ProbeTarget> {
    let mut out = Vec::new();
    for vs in &config.virtual_storages {
        for storage in &vs.storages {
            out.push(ProbeTarget {
                virtual_storage: VirtualStorage(vs.name.clone()),
                storage: StorageName(storage.name.clone()),
                endpoint: coord_backend::Endpoint { address: storage.address.clone(), token: storage.token.clone() },
            });
        }
    }
    out
}

fn all_targets(config: &Config) -> Vec<(VirtualStorage, StorageName)> {
    let mut out = Vec::new();
    for vs in &config.virtual_storages {
        for storage in &vs.storages {
            out.push((VirtualStorage(vs.name.clone()), StorageName(storage.name.clone())));
        }
    }
    out
}
