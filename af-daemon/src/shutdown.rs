//! Shutdown handling for graceful daemon termination
//!
//! A single watch channel fans the cancellation signal out to every sensor
//! monitor and fan controller. Controllers observe it at each suspension
//! point and return without a recovery write; only error paths touch the
//! hardware on the way out.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Create the process-wide shutdown channel.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once the shutdown flag is raised (or the sender is gone).
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("SIGNAL: Received Ctrl+C, shutting down gracefully...");
        }
        _ = terminate => {
            info!("SIGNAL: Received SIGTERM, shutting down gracefully...");
        }
    }
}
