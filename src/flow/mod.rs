//! Request admission (flow control) subsystem.
//!
//! # Data Flow
//! ```text
//! Authenticated request:
//!     → ows.rs (classify service / request / output format)
//!     → keys.rs (client IP, user key, priority)
//!     → gate.rs (run applicable controllers, most restrictive first)
//!         → rate.rs (per user / IP request rate, never holds a slot)
//!         → controller.rs (global, per OWS matcher, per user, per IP)
//!             → queue.rs (slot or wait until deadline)
//!     → Admission held until the response body is done
//! ```
//!
//! # Design Decisions
//! - One deadline covers the whole admission, not one per controller
//! - A rejected admission releases what it already holds, in reverse order
//! - Release is tied to `Drop`, so requests that never finish cleanly
//!   (client gone, task cancelled, handler panic) still free their slots

pub mod controller;
pub mod gate;
pub mod keys;
pub mod middleware;
pub mod ows;
pub mod queue;
pub mod rate;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::IpAddr;

pub use controller::{ControllerStats, FlowController, Ticket};
pub use gate::{Admission, FlowConfigError, FlowGate, GateStats};
pub use keys::RequestContext;
pub use ows::{OwsMatcher, OwsRequest};
pub use queue::{SlotPermit, SlotQueue};
pub use rate::{RateController, RateRule};

/// Rate limit state reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateHeaders {
    pub context: String,
    pub limit: u64,
    pub remaining: u64,
    /// End of the current window, epoch milliseconds.
    pub reset_epoch_ms: u64,
    pub action: String,
}

impl RateHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        let mut set = |name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        };
        set("x-rate-limit-context", self.context.clone());
        set("x-rate-limit-limit", self.limit.to_string());
        set("x-rate-limit-remaining", self.remaining.to_string());
        set("x-rate-limit-reset", self.reset_epoch_ms.to_string());
        set("x-rate-limit-action", self.action.clone());
    }
}

/// Why a request was not admitted.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("request timed out waiting in the '{controller}' queue, please lower your request rate")]
    Timeout {
        controller: String,
        /// Rate state of controllers passed before the queue timed out.
        rate: Option<RateHeaders>,
    },

    #[error("too many requests in the current time period, check the X-Rate-Limit response headers")]
    RateLimited(RateHeaders),

    #[error("requests from {0} are not allowed")]
    Blocked(IpAddr),
}

impl Rejection {
    pub fn timeout(controller: impl Into<String>) -> Self {
        Rejection::Timeout {
            controller: controller.into(),
            rate: None,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Timeout { .. } => "timeout",
            Rejection::RateLimited(_) => "rate",
            Rejection::Blocked(_) => "blocked",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = match &self {
            Rejection::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Blocked(_) => StatusCode::FORBIDDEN,
        };
        let mut response = (status, self.to_string()).into_response();
        match &self {
            Rejection::RateLimited(headers)
            | Rejection::Timeout {
                rate: Some(headers),
                ..
            } => headers.apply(response.headers_mut()),
            _ => {}
        }
        response
    }
}
