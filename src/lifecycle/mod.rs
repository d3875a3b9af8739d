//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     root scope → multiplexer scope → accept scope / sub-listener scopes
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful multiplexer shutdown
//! ```
//!
//! # Design Decisions
//! - Cancellation is a scope tree, not a single broadcast
//! - Ordered shutdown: stop accept, drain connections, close sub-listeners
//! - Shutdown has a grace period; forced close after it

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
