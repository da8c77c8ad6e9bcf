//! Authentication subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → chain.rs (try each configured filter in order)
//!         → filter.rs (extract credentials, derive cache key)
//!         → cache.rs (hit: reuse the earlier authentication)
//!         → filter.rs (miss: verify credentials, then cache the result)
//!     → middleware.rs (attach Authentication to the request, or challenge)
//! ```
//!
//! # Design Decisions
//! - Cache keys are hashes of the credential material, never raw secrets
//! - Entries are scoped per filter so one filter can be flushed alone
//! - Failed authentications are never cached

pub mod cache;
pub mod chain;
pub mod filter;
pub mod middleware;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub use cache::{AuthenticationCache, CacheSettings, CacheStats, CachedEntry};
pub use chain::FilterChain;
pub use filter::{Authenticator, Credentials};

/// The outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authentication {
    pub principal: String,
    pub roles: Vec<String>,
    /// Name of the filter that authenticated the request.
    pub filter: String,
    /// Seconds since epoch.
    pub authenticated_at: u64,
}

impl Authentication {
    pub fn new(principal: impl Into<String>, roles: Vec<String>, filter: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            roles,
            filter: filter.into(),
            authenticated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Errors that can occur while authenticating a request.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Credentials were presented but did not verify.
    #[error("bad credentials for filter '{filter}'")]
    BadCredentials { filter: String },

    /// The credential header could not be decoded.
    #[error("malformed credentials: {0}")]
    Malformed(&'static str),

    /// No credentials and anonymous access is disabled.
    #[error("authentication required")]
    Required { realm: String },

    #[error("password verification failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),

    #[error("authentication task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::BadCredentials { .. } | AuthError::Malformed(_) | AuthError::Required { .. } => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Hashing(_) | AuthError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut response = (status, self.to_string()).into_response();
        if let AuthError::Required { realm } = &self {
            if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm)) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
            }
        }
        response
    }
}
