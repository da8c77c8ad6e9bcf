//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request id, tracing, limits)
//!     → [security → auth → flow middleware]
//!     → upstream.rs (rewrite onto the upstream, forward, stream back)
//!     → Send to client
//! ```

pub mod server;
pub mod upstream;

pub use server::{AppState, GateState, HttpServer, StateError};
pub use upstream::{Upstream, UpstreamError};
