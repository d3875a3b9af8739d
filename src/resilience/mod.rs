//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept error:
//!     → net::listener::is_transient_accept_error (classify)
//!     → backoff.rs (sleep 5ms, 10ms, ... capped at 1s, then retry)
//!     → success resets the curve
//! ```
//!
//! # Design Decisions
//! - Only transient errors are retried; fatal ones end the accept loop
//! - Jitter stays inside the cap

pub mod backoff;

pub use backoff::Backoff;
