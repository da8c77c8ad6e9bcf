//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain in-flight requests → Exit
//!     Background tasks (cache sweeper, queue janitor, reload loop) stop too
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Reload the config file
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
