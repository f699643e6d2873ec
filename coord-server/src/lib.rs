// SPDX-License-Identifier: Apache-2.0

//! Binary crate wiring (SPEC_FULL.md §1 "Process shape"): configuration,
//! CLI args, logging init, and the running server, kept in a library
//! target so `src/main.rs` stays a thin entry point.

pub mod args;
pub mod config;
pub mod logging;
pub mod server;
pub mod signals;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use args::Args;
use config::Config;

/// Runs the coordinator process until it receives a termination signal.
pub async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    let coordinator_id = args.coordinator_id.clone().unwrap_or_else(default_coordinator_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals_task = tokio::spawn(signals::routine(shutdown_tx));

    let listen_addr: std::net::SocketAddr = args.listen_addr.parse()?;
    let coordinator_address = format!("{coordinator_id}@{}", args.listen_addr);

    info!(%coordinator_id, %listen_addr, "starting coordinator");
    let built = server::build(&config, &coordinator_id, &coordinator_address, shutdown_rx.clone()).await?;

    let voting = tokio::spawn({
        let coordinator = built.coordinator.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { server::serve_voting(&coordinator, listen_addr, shutdown_rx).await }
    });

    built.joined().await;
    voting.await??;
    signals_task.await??;

    info!("coordinator shut down cleanly");
    Ok(())
}

fn default_coordinator_id() -> String {
    hostname_fallback()
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "coord-0".to_string())
}
