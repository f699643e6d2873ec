// SPDX-License-Identifier: Apache-2.0

//! Cluster topology and tuning config (spec.md §6 "process env/config"):
//! a single TOML file plus environment variable overrides, layered with
//! the `config` crate and validated eagerly at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use coord_backend::{Endpoint, EndpointTable};
use coord_core::{Assignment, StorageName, VirtualStorage};
use coord_router::VirtualStorageTopology;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    pub address: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualStorageConfig {
    pub name: String,
    pub storages: Vec<StorageConfig>,
    /// Subset of `storages` eligible to hold each repository in this
    /// virtual storage (spec.md §3 Assignment). Empty/absent means "all
    /// storages in the virtual storage are eligible."
    #[serde(default)]
    pub assigned: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub virtual_storages: Vec<VirtualStorageConfig>,

    /// `postgres://...` connection string for [`coord_datastore::PgDatastore`].
    pub datastore_url: String,
    #[serde(default = "defaults::datastore_max_connections")]
    pub datastore_max_connections: u32,

    #[serde(default = "defaults::probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "defaults::probe_deadline_secs")]
    pub probe_deadline_secs: u64,
    #[serde(default = "defaults::healthy_window_secs")]
    pub healthy_window_secs: u64,
    #[serde(default = "defaults::health_cache_ttl_ms")]
    pub health_cache_ttl_ms: u64,

    #[serde(default = "defaults::election_interval_secs")]
    pub election_interval_secs: u64,
    /// Window the elector's tie-break (spec.md §4.7 step 2, "fewest
    /// failed replication jobs in the last bounded window") is meant to
    /// cover. See `coord_elect`'s note on `failed_job_count`: the
    /// datastore currently reports a present-tense count rather than one
    /// truly bounded by this window.
    #[serde(default = "defaults::election_failed_job_window_secs")]
    pub election_failed_job_window_secs: u64,

    #[serde(default = "defaults::reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "defaults::replication_workers_per_target")]
    pub replication_workers_per_target: usize,
    #[serde(default = "defaults::max_replication_attempts")]
    pub max_replication_attempts: i32,
    #[serde(default = "defaults::replication_poll_interval_ms")]
    pub replication_poll_interval_ms: u64,
    #[serde(default = "defaults::replication_backoff_base_ms")]
    pub replication_backoff_base_ms: u64,

    #[serde(default = "defaults::vote_timeout_secs")]
    pub vote_timeout_secs: u64,
    /// How many participants a reference-transaction vote may lose and
    /// still commit (spec.md §4.5 step 2: "strong voting; configurable to
    /// allow failures"). 0 is strong voting (every addressed participant
    /// must agree); the effective threshold is clamped to the registry's
    /// required minimum of `ceil((total+1)/2)` regardless of this value.
    #[serde(default = "defaults::max_tolerated_vote_failures")]
    pub max_tolerated_vote_failures: u32,
}

mod defaults {
    pub fn datastore_max_connections() -> u32 {
        10
    }
    pub fn probe_interval_secs() -> u64 {
        5
    }
    pub fn probe_deadline_secs() -> u64 {
        2
    }
    pub fn healthy_window_secs() -> u64 {
        30
    }
    pub fn health_cache_ttl_ms() -> u64 {
        500
    }
    pub fn election_interval_secs() -> u64 {
        10
    }
    pub fn reconcile_interval_secs() -> u64 {
        60
    }
    pub fn replication_workers_per_target() -> usize {
        4
    }
    pub fn max_replication_attempts() -> i32 {
        5
    }
    pub fn replication_poll_interval_ms() -> u64 {
        500
    }
    pub fn replication_backoff_base_ms() -> u64 {
        1000
    }
    pub fn vote_timeout_secs() -> u64 {
        30
    }
    pub fn max_tolerated_vote_failures() -> u32 {
        0
    }
    pub fn election_failed_job_window_secs() -> u64 {
        300
    }
}

impl Config {
    /// Loads `path` (if present) layered under `COORD_`-prefixed
    /// environment variables, then validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        let raw = builder
            .add_source(config::Environment::with_prefix("COORD").separator("__"))
            .build()
            .context("failed to assemble configuration layers")?;
        let cfg: Config = raw.try_deserialize().context("failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.virtual_storages.is_empty() {
            bail!("configuration must declare at least one virtual storage");
        }
        for vs in &self.virtual_storages {
            if vs.storages.is_empty() {
                bail!("virtual storage {:?} declares no storages", vs.name);
            }
            let mut seen = std::collections::HashSet::new();
            for storage in &vs.storages {
                if !seen.insert(&storage.name) {
                    bail!("virtual storage {:?} declares storage {:?} twice", vs.name, storage.name);
                }
            }
            for assigned in &vs.assigned {
                if !vs.storages.iter().any(|s| &s.name == assigned) {
                    bail!("virtual storage {:?} assigns unknown storage {:?}", vs.name, assigned);
                }
            }
        }
        Ok(())
    }

    pub fn topologies(&self) -> Vec<VirtualStorageTopology> {
        self.virtual_storages
            .iter()
            .map(|vs| {
                VirtualStorageTopology::new(
                    VirtualStorage(vs.name.clone()),
                    vs.storages.iter().map(|s| StorageName(s.name.clone())).collect(),
                )
            })
            .collect()
    }

    pub fn endpoint_table(&self) -> EndpointTable {
        let mut entries = HashMap::new();
        for vs in &self.virtual_storages {
            for storage in &vs.storages {
                entries.insert(
                    (VirtualStorage(vs.name.clone()), StorageName(storage.name.clone())),
                    Endpoint { address: storage.address.clone(), token: storage.token.clone() },
                );
            }
        }
        EndpointTable::new(entries)
    }

    /// Static assignment, if the virtual storage config named any.
    /// Per-repository assignments still live in the datastore
    /// (`SetAssignments`/`GetAssignments`); this is only the process-wide
    /// default applied to newly created repositories.
    pub fn default_assignment(&self, virtual_storage: &VirtualStorage) -> Assignment {
        self.virtual_storages
            .iter()
            .find(|vs| vs.name == virtual_storage.0)
            .map(|vs| Assignment { storages: vs.assigned.iter().map(|s| StorageName(s.clone())).collect() })
            .unwrap_or_default()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }
    pub fn healthy_window(&self) -> Duration {
        Duration::from_secs(self.healthy_window_secs)
    }
    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.health_cache_ttl_ms)
    }
    pub fn election_interval(&self) -> Duration {
        Duration::from_secs(self.election_interval_secs)
    }
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_secs(self.vote_timeout_secs)
    }
    pub fn election_failed_job_window(&self) -> Duration {
        Duration::from_secs(self.election_failed_job_window_secs)
    }
}
