//! Authenticating, flow-controlling gateway for OGC web services.

pub mod admin;
pub mod auth;
pub mod config;
pub mod flow;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;

pub use config::schema::GateConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
