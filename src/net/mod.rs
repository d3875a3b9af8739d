//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, optional deferred TLS handshake)
//!     → connection.rs (id, state tracking, force-close signal)
//!     → replay.rs (sniff buffer, deadlines)
//!     → Hand off to the multiplexer's matchers
//!
//! Connection States:
//!     New → Active → Hijacked | Idle → Closed
//! ```
//!
//! # Design Decisions
//! - Sniffed bytes are buffered, never discarded
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod replay;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// A transport-level byte stream (TCP, TLS over TCP, in-memory pipes).
pub trait RawIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> RawIo for T {}

pub use connection::{ConnState, ConnectionId, ListenerId};
pub use listener::{Incoming, RawListener, TlsListener};
pub use replay::{ReplayConn, Sniffer};
