// SPDX-License-Identifier: Apache-2.0

use tokio::sync::watch;
use tracing::{info, instrument};

/// Waits for SIGINT/SIGTERM (Ctrl-C on Windows) and flips `shutdown` to
/// `true`, the signal every subsystem's run loop selects on to stop
/// cleanly (spec.md §5 "Cancellation semantics").
#[cfg(unix)]
#[instrument(name = "signals subroutine", skip(shutdown))]
pub async fn routine(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    };

    let _ = shutdown.send(true);
    Ok(())
}

#[cfg(windows)]
#[instrument(name = "signals subroutine", skip(shutdown))]
pub async fn routine(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    let _ = shutdown.send(true);
    Ok(())
}
