use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::auth::{CacheStats, CachedEntry};
use crate::flow::GateStats;
use crate::http::server::AppState;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub upstream: String,
    pub filters: Vec<String>,
}

#[derive(Serialize)]
pub struct CacheReport {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub per_filter: Vec<FilterEntries>,
}

#[derive(Serialize)]
pub struct FilterEntries {
    pub filter: String,
    pub entries: usize,
}

/// Cached entries of one filter; `key` is what the single-entry delete takes.
#[derive(Serialize)]
pub struct FilterListing {
    pub filter: String,
    pub entries: Vec<CachedEntry>,
}

#[derive(Serialize)]
pub struct Removed {
    pub removed: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let inner = state.inner.load_full();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        upstream: inner.config.upstream.url.clone(),
        filters: inner.auth.filter_names().into_iter().map(String::from).collect(),
    })
}

pub async fn get_flow(State(state): State<AppState>) -> Json<GateStats> {
    Json(state.inner.load().flow.stats())
}

pub async fn get_auth_cache(State(state): State<AppState>) -> Json<CacheReport> {
    let inner = state.inner.load_full();
    let cache = inner.auth.cache();
    let per_filter = inner
        .auth
        .filter_names()
        .into_iter()
        .map(|filter| FilterEntries {
            filter: filter.to_string(),
            entries: cache.keys_for(filter).len(),
        })
        .collect();
    Json(CacheReport {
        stats: cache.stats(),
        per_filter,
    })
}

pub async fn list_filter(
    State(state): State<AppState>,
    Path(filter): Path<String>,
) -> Json<FilterListing> {
    let entries = state.inner.load().auth.cache().entries_for(&filter);
    Json(FilterListing { filter, entries })
}

pub async fn clear_auth_cache(State(state): State<AppState>) -> Json<Removed> {
    let removed = state.inner.load().auth.cache().remove_all();
    tracing::info!(removed, "Authentication cache cleared");
    Json(Removed { removed })
}

pub async fn clear_filter(State(state): State<AppState>, Path(filter): Path<String>) -> Json<Removed> {
    let removed = state.inner.load().auth.cache().remove_all_for(&filter);
    tracing::info!(filter = %filter, removed, "Authentication cache cleared for filter");
    Json(Removed { removed })
}

pub async fn remove_entry(
    State(state): State<AppState>,
    Path((filter, key)): Path<(String, String)>,
) -> Json<Removed> {
    let removed = usize::from(state.inner.load().auth.cache().remove(&filter, &key));
    tracing::info!(filter = %filter, removed, "Authentication cache entry removed");
    Json(Removed { removed })
}
