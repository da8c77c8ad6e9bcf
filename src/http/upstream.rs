//! Forwarding admitted requests to the protected OWS server.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the upstream base URL
//! - Strip hop-by-hop headers in both directions
//! - Add X-Forwarded-For, X-Forwarded-Host and X-Forwarded-User
//! - Bound the wait for response headers by `timeouts.upstream_secs`

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version};
use axum::response::IntoResponse;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::Authentication;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_USER: &str = "x-forwarded-user";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Errors talking to the upstream server.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream url '{0}', expected http://host[:port][/path]")]
    InvalidBase(String),

    #[error("could not build upstream request: {0}")]
    BadUri(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            UpstreamError::InvalidBase(_) | UpstreamError::BadUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UpstreamError::Connect(_) => StatusCode::BAD_GATEWAY,
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        (status, self.to_string()).into_response()
    }
}

/// The upstream server and a pooled client for it.
#[derive(Clone)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    /// Base path without trailing slash; empty for the root.
    base_path: String,
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl Upstream {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let invalid = || UpstreamError::InvalidBase(url.to_string());
        let uri: Uri = url.parse().map_err(|_| invalid())?;
        let scheme = uri.scheme().cloned().ok_or_else(invalid)?;
        if scheme != Scheme::HTTP {
            return Err(invalid());
        }
        let authority = uri.authority().cloned().ok_or_else(invalid)?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Map a gateway request URI onto the upstream.
    pub fn target(&self, uri: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Ok(Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()?)
    }

    /// Forward `request` and stream back the upstream response.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, UpstreamError> {
        let (mut parts, body) = request.into_parts();
        parts.uri = self.target(&parts.uri)?;
        parts.version = Version::HTTP_11;

        let host = parts.headers.remove(header::HOST);
        strip_hop_by_hop(&mut parts.headers);

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if let Some(peer) = peer {
            append_forwarded_for(&mut parts.headers, &peer.to_string());
        }
        if let Some(host) = host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }

        parts.headers.remove(X_FORWARDED_USER);
        let principal = parts
            .extensions
            .get::<Authentication>()
            .and_then(|auth| HeaderValue::from_str(&auth.principal).ok());
        if let Some(principal) = principal {
            parts.headers.insert(X_FORWARDED_USER, principal);
        }

        let request = Request::from_parts(parts, body);
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), addr),
        _ => addr.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
