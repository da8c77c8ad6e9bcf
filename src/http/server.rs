//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the gateway state (auth chain, flow gate, blocklist, upstream)
//! - Wire up middleware (request id, tracing, limits, security, auth, flow)
//! - Swap state atomically when a new configuration arrives
//! - Serve plain TCP or TLS with graceful shutdown

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::auth::chain::UnknownFilter;
use crate::auth::middleware::authentication_middleware;
use crate::auth::FilterChain;
use crate::config::GateConfig;
use crate::flow::middleware::flow_control_middleware;
use crate::flow::{FlowConfigError, FlowGate};
use crate::http::upstream::{Upstream, UpstreamError};
use crate::observability::metrics;
use crate::security::access_control::blocklist_middleware;
use crate::security::Blocklist;

/// Errors building gateway state from a configuration.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("flow control: {0}")]
    Flow(#[from] FlowConfigError),

    #[error(transparent)]
    Auth(#[from] UnknownFilter),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("invalid blocklist address '{0}'")]
    Blocklist(String),
}

/// Everything derived from one configuration.
pub struct GateState {
    pub config: GateConfig,
    pub auth: FilterChain,
    pub flow: Arc<FlowGate>,
    pub blocklist: Blocklist,
    pub upstream: Upstream,
}

impl GateState {
    pub fn build(config: GateConfig) -> Result<Self, StateError> {
        let auth = FilterChain::from_config(&config.auth)?;
        let flow = Arc::new(FlowGate::from_config(&config.flow)?);
        let blocklist = Blocklist::parse(&config.flow.ip_blocklist).map_err(StateError::Blocklist)?;
        let upstream = Upstream::new(
            &config.upstream.url,
            Duration::from_secs(config.timeouts.upstream_secs),
        )?;

        Ok(Self {
            config,
            auth,
            flow,
            blocklist,
            upstream,
        })
    }

    /// Start the cache sweeper and queue janitor. Both stop on shutdown or
    /// once this state has been replaced and dropped.
    fn spawn_maintenance(&self, shutdown: &broadcast::Receiver<()>) {
        let sweep = Duration::from_secs(self.config.auth.cache.sweep_interval_secs.max(1));
        self.auth.cache().spawn_sweeper(sweep, shutdown.resubscribe());
        if !self.flow.is_empty() {
            self.flow.spawn_janitor(shutdown.resubscribe());
        }
    }
}

/// Application state injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<ArcSwap<GateState>>,
    pub started: Instant,
}

impl AppState {
    pub fn new(state: GateState) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(state)),
            started: Instant::now(),
        }
    }

    /// Replace the state with one built from `config`.
    ///
    /// Requests already admitted keep the controllers they were admitted by.
    pub fn reload(&self, config: GateConfig) -> Result<Arc<GateState>, StateError> {
        let next = Arc::new(GateState::build(config)?);
        self.inner.store(Arc::clone(&next));
        Ok(next)
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: GateConfig) -> Result<Self, StateError> {
        Ok(Self {
            state: AppState::new(GateState::build(config)?),
        })
    }

    /// Shared state, for mounting the admin API next to the gateway.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Timeouts and the connection limit are read once here; they do not
    /// follow configuration reloads.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let config = state.inner.load_full().config.clone();

        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .layer(middleware::from_fn_with_state(state.clone(), flow_control_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), authentication_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), blocklist_middleware))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(GlobalConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(middleware::from_fn(track_requests))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<GateConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        self.spawn_background(config_updates, &shutdown);
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server behind TLS.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        config_updates: mpsc::UnboundedReceiver<GateConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        self.spawn_background(config_updates, &shutdown);
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();

        let handle = axum_server::Handle::new();
        let stopper = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutdown signal received");
            stopper.graceful_shutdown(Some(Duration::from_secs(30)));
        });

        axum_server::bind_rustls(addr, tls).handle(handle).serve(app).await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    fn spawn_background(
        &self,
        mut config_updates: mpsc::UnboundedReceiver<GateConfig>,
        shutdown: &broadcast::Receiver<()>,
    ) {
        self.state.inner.load().spawn_maintenance(shutdown);

        let state = self.state.clone();
        let maintenance = shutdown.resubscribe();
        let mut stop = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = config_updates.recv() => {
                        let Some(config) = update else { break };
                        match state.reload(config) {
                            Ok(next) => {
                                next.spawn_maintenance(&maintenance);
                                tracing::info!(
                                    upstream = %next.upstream.authority(),
                                    filters = ?next.auth.filter_names(),
                                    "Configuration reloaded"
                                );
                            }
                            Err(e) => tracing::error!(
                                error = %e,
                                "Rejected configuration update, keeping current state"
                            ),
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });
    }
}

/// Count and time every request, whatever answered it.
async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let response = next.run(request).await;
    metrics::record_request(method.as_str(), response.status().as_u16(), start);
    response
}

/// Forward an admitted request upstream.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let upstream = state.inner.load().upstream.clone();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    tracing::debug!(method = %method, path = %path, "Proxying request");

    match upstream.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(method = %method, path = %path, error = %e, "Upstream request failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_bad_configs() {
        let mut config = GateConfig::default();
        config.flow.ip_blocklist = vec!["nope".into()];
        assert!(matches!(GateState::build(config), Err(StateError::Blocklist(_))));

        let mut config = GateConfig::default();
        config.upstream.url = "ftp://geo".into();
        assert!(matches!(GateState::build(config), Err(StateError::Upstream(_))));

        let mut config = GateConfig::default();
        config.auth.filters = vec!["ldap".into()];
        assert!(matches!(GateState::build(config), Err(StateError::Auth(_))));
    }

    #[test]
    fn reload_swaps_state() {
        let state = AppState::new(GateState::build(GateConfig::default()).unwrap());
        assert!(state.inner.load().flow.is_empty());

        let mut config = GateConfig::default();
        config.flow.global = Some(4);
        state.reload(config).unwrap();
        assert!(!state.inner.load().flow.is_empty());

        let mut broken = GateConfig::default();
        broken.flow.global = Some(0);
        assert!(state.reload(broken).is_err());
        assert_eq!(state.inner.load().config.flow.global, Some(4));
    }
}
