//! IP blocklist middleware.
//!
//! Blocked clients are turned away before authentication runs, so they never
//! cost a password verification.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::net::IpAddr;

use crate::flow::{keys, Rejection};
use crate::http::server::AppState;
use crate::observability::metrics;

/// Addresses that are refused outright.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    addresses: HashSet<IpAddr>,
}

impl Blocklist {
    /// Parse the configured addresses, returning the first invalid entry on
    /// failure.
    pub fn parse(entries: &[String]) -> Result<Self, String> {
        let addresses = entries
            .iter()
            .map(|entry| entry.trim().parse::<IpAddr>().map_err(|_| entry.clone()))
            .collect::<Result<_, _>>()?;
        Ok(Self { addresses })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }
}

pub async fn blocklist_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let inner = state.inner.load_full();
    if inner.blocklist.is_empty() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let ip = keys::client_ip(&parts);
    if inner.blocklist.contains(&ip) {
        tracing::info!(client_ip = %ip, path = %parts.uri.path(), "Blocked client refused");
        let rejection = Rejection::Blocked(ip);
        metrics::record_flow_rejection(rejection.reason());
        return rejection.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6_addresses() {
        let list = Blocklist::parse(&["10.0.0.1".into(), " ::1 ".into()]).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&"10.0.0.1".parse().unwrap()));
        assert!(list.contains(&"::1".parse().unwrap()));
        assert!(!list.contains(&"10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn reports_the_bad_entry() {
        let err = Blocklist::parse(&["10.0.0.1".into(), "10.0.0.0/8".into()]).unwrap_err();
        assert_eq!(err, "10.0.0.0/8");
    }
}
