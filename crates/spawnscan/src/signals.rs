//! Signal handling for graceful scan shutdown.
//!
//! A termination signal does not kill the process: it triggers the scan's
//! [`Shutdown`], the workers stop at their next dequeue or sleep, and the
//! results gathered so far are still written out.

use scan_core::Shutdown;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Waits for SIGINT or SIGTERM (Ctrl+C on Windows).
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

/// Triggers `shutdown` on the first termination signal.
pub fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("🛑 Stopping scan, results so far will be saved");
                shutdown.trigger();
            }
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
    })
}
