//! Shutdown Signal Handling
//!
//! Waits for SIGTERM, SIGINT or Ctrl+C so the binary can tear the transport
//! down cleanly.

use tokio::signal;
use tracing::info;

use crate::Result;

/// Resolve once the process is asked to stop.
pub async fn wait_for_signal() -> Result<()> {
    info!("Starting shutdown signal listener");

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
