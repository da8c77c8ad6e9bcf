//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (refuse blocklisted client addresses)
//!     → Pass to authentication
//! ```
//!
//! # Design Decisions
//! - Fail closed: an unparsable blocklist entry rejects the whole config
//! - Runs before authentication so blocked clients cost nothing

pub mod access_control;

pub use access_control::Blocklist;
