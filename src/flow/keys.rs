//! Caller identity for flow control: client address, user key, priority.

use axum::extract::ConnectInfo;
use axum::http::{header, request::Parts, HeaderMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::auth::Authentication;
use crate::config::schema::PriorityConfig;
use crate::flow::ows::OwsRequest;

/// Everything a flow controller looks at when admitting a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ows: OwsRequest,
    pub client_ip: IpAddr,
    /// Authenticated principal or the flow cookie value.
    pub user_key: String,
    pub priority: i32,
}

impl RequestContext {
    pub fn new(ows: OwsRequest, client_ip: IpAddr, user_key: impl Into<String>) -> Self {
        Self {
            ows,
            client_ip,
            user_key: user_key.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// How the user key of a request was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserKey {
    Principal(String),
    Cookie(String),
    /// No identity yet; the response must set this cookie value.
    Issued(String),
}

impl UserKey {
    pub fn value(&self) -> &str {
        match self {
            UserKey::Principal(v) | UserKey::Cookie(v) | UserKey::Issued(v) => v,
        }
    }
}

/// The client address: first `X-Forwarded-For` hop, else the socket peer.
pub fn client_ip(parts: &Parts) -> IpAddr {
    forwarded_for(&parts.headers).unwrap_or_else(|| {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    })
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Identify the user: authenticated principal, flow cookie, or a new cookie.
pub fn user_key(parts: &Parts, cookie_name: &str) -> UserKey {
    if let Some(auth) = parts.extensions.get::<Authentication>() {
        return UserKey::Principal(auth.principal.clone());
    }
    match cookie_value(&parts.headers, cookie_name) {
        Some(value) => UserKey::Cookie(value),
        None => UserKey::Issued(uuid::Uuid::new_v4().simple().to_string()),
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// Queue priority from the configured header, falling back to its default.
pub fn priority(headers: &HeaderMap, config: Option<&PriorityConfig>) -> i32 {
    let Some(config) = config else {
        return 0;
    };
    headers
        .get(config.header.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(config.default)
}
