//! Multiplexer subsystem.
//!
//! # Data Flow
//! ```text
//! serve(listener)
//!     → accept loop (backoff on accept errors, one task per connection)
//!     → connection task: track (New) → sniff groups in order (Active)
//!         matched   → MuxConn (Hijacked) → group's SubListener queue
//!         unmatched → error policy (NotMatched) → close (Idle → Closed)
//!     → protocol server: sub_listener.accept()
//! ```
//!
//! # Design Decisions
//! - Bounded queues: a slow consumer blocks its own handoffs, not the accept loop
//! - Every queued or abandoned connection is closed exactly once
//! - `close` is immediate; `shutdown` waits for busy connections

pub mod error;
pub mod group;
pub mod multiplexer;
pub mod policy;
pub mod sub_listener;

pub use error::{AbortHandler, MuxError};
pub use group::MatcherGroup;
pub use multiplexer::Multiplexer;
pub use policy::{default_policy, ErrorPolicy};
pub use sub_listener::{MuxConn, SubListener};
