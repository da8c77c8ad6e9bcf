//! OS signal handling.
//!
//! SIGTERM and SIGINT trigger graceful shutdown. SIGHUP reloads the config
//! file without restarting.

use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::config::watcher;
use crate::config::GateConfig;
use crate::lifecycle::Shutdown;

/// Resolve once SIGINT (or SIGTERM on unix) arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}

/// Trigger `shutdown` on the first termination signal.
pub fn spawn_shutdown_on_signal(shutdown: Shutdown) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });
}

/// Reload `path` into `tx` on every SIGHUP until shutdown.
#[cfg(unix)]
pub fn spawn_reload_on_sighup(path: PathBuf, tx: mpsc::UnboundedSender<GateConfig>, shutdown: &Shutdown) {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGHUP");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    tracing::info!(path = ?path, "SIGHUP received, reloading config");
                    watcher::reload(&path, &tx);
                }
                _ = stop.recv() => break,
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_sighup(_path: PathBuf, _tx: mpsc::UnboundedSender<GateConfig>, _shutdown: &Shutdown) {}
