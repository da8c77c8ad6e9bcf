//! ows-gate
//!
//! A gateway in front of an OGC web services server (WMS, WFS, WCS, WPS,
//! WMTS, CSW).
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────▶ net listener ──▶ http server (request id, trace, limits)
//!                                      │
//!                                      ▼
//!                               security (IP blocklist)
//!                                      │
//!                                      ▼
//!                               auth (filter chain + LRU cache)
//!                                      │
//!                                      ▼
//!                               flow (rate, global, OWS, user, IP queues)
//!                                      │
//!                                      ▼
//!     Client Response ◀──────── upstream forward ◀────▶ OWS server
//!
//!     Side channels: admin API, Prometheus metrics, config watcher
//! ```

use clap::Parser;
use std::path::PathBuf;

use ows_gate::admin::setup_admin_router;
use ows_gate::config::{load_config, ConfigWatcher, GateConfig};
use ows_gate::lifecycle::signals;
use ows_gate::net::{listener, tls};
use ows_gate::observability::{logging, metrics};
use ows_gate::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "ows-gate", version, about = "Authenticating, flow-controlling OWS gateway")]
struct Args {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(short, long, env = "OWS_GATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ows-gate starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.url,
        filters = ?config.auth.filters,
        flow_enabled = config.flow.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    signals::spawn_shutdown_on_signal(shutdown.clone());

    // The watcher must stay alive for the process lifetime.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            signals::spawn_reload_on_sighup(path.clone(), watcher.sender(), &shutdown);
            (Some(watcher.run()?), updates)
        }
        None => (None, tokio::sync::mpsc::unbounded_channel().1),
    };

    let server = HttpServer::new(config.clone())?;

    if config.admin.enabled {
        let admin_listener = tokio::net::TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let app = setup_admin_router(server.state());
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    match &config.listener.tls {
        Some(tls_config) => {
            let addr = listener::bind_address(&config.listener)?;
            let rustls = tls::load_tls_config(tls_config).await?;
            server.run_tls(addr, rustls, config_updates, shutdown.subscribe()).await?;
        }
        None => {
            let listener = listener::bind(&config.listener).await?;
            server.run(listener, config_updates, shutdown.subscribe()).await?;
        }
    }

    shutdown.trigger();
    tracing::info!("Shutdown complete");
    Ok(())
}
