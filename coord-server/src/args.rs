// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;

/// Process-level knobs read from argv/env (spec.md §6 "process
/// env/config"). Cluster topology and per-storage tuning live in the
/// config file `--config` points at; only the file's location and a
/// handful of process concerns (bind address, log verbosity) are
/// exposed here, mirroring the reference workspace's split between argv
/// for process-level knobs and a structured config file for cluster
/// topology.
#[derive(Debug, Parser)]
#[clap(name = "coord-server")]
pub struct Args {
    /// Path to the TOML config file describing virtual storages, storage
    /// endpoints, the datastore connection, and tuning knobs.
    #[clap(long, env = "COORD_CONFIG", default_value = "coord-server.toml")]
    pub config: PathBuf,

    /// Address the client-facing and `VoteTransaction` gRPC services bind.
    #[clap(long, env = "COORD_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    pub listen_addr: String,

    /// This coordinator's identity, used as the `coordinator_id` in health
    /// records (spec.md §3) and as the address replicas dial back to for
    /// `VoteTransaction` (spec.md §4.5 step 2).
    #[clap(long, env = "COORD_ID")]
    pub coordinator_id: Option<String>,
}
