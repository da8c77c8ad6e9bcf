//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, resolve the local address)
//!     → tls.rs (optional TLS termination via axum-server)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - `max_connections` bounds in-flight requests at the HTTP layer
//! - TLS is optional and handled transparently

pub mod listener;
pub mod tls;
