//! Admin API: gateway status, flow statistics and authentication cache
//! management, behind a bearer API key.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/flow", get(get_flow))
        .route("/admin/auth-cache", get(get_auth_cache).delete(clear_auth_cache))
        .route("/admin/auth-cache/{filter}", get(list_filter).delete(clear_filter))
        .route("/admin/auth-cache/{filter}/{key}", delete(remove_entry))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
