//! Errors surfaced by the multiplexer.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::net::ConnectionId;

/// Error type for multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No matcher in any group claimed the connection.
    #[error("no matcher claimed connection {id} from {peer_addr}")]
    NotMatched { id: ConnectionId, peer_addr: SocketAddr },

    /// The (sub-)listener was closed.
    #[error("listener closed")]
    ListenerClosed,

    /// The multiplexer was closed or shut down.
    #[error("multiplexer closed")]
    ServerClosed,

    /// A handoff was abandoned because its scope was cancelled.
    #[error("handoff cancelled")]
    Cancelled,

    /// Graceful shutdown did not finish within its grace period.
    #[error("shutdown grace period expired with {remaining} connection(s) still open")]
    ShutdownTimeout { remaining: usize },

    /// Failed to bind to address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    /// TLS setup failed.
    #[error("tls setup failed: {0}")]
    Tls(#[source] io::Error),
}

impl MuxError {
    /// Worth retrying: the condition is expected to clear on its own.
    pub fn is_temporary(&self) -> bool {
        match self {
            MuxError::NotMatched { .. } => true,
            MuxError::Accept(e) => crate::net::listener::is_transient_accept_error(e),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            MuxError::ShutdownTimeout { .. } => true,
            MuxError::Accept(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Panic payload for deliberately aborted handlers.
///
/// `std::panic::panic_any(AbortHandler)` unwinds out of a matcher, an error
/// policy or a `match_and_go_serve` handler without the panic being logged.
/// The connection involved is still closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortHandler;

impl std::fmt::Display for AbortHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("handler aborted")
    }
}

impl std::error::Error for AbortHandler {}

/// Human-readable panic payload, `None` for [`AbortHandler`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if payload.is::<AbortHandler>() {
        return None;
    }
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_and_timeout_classification() {
        let not_matched = MuxError::NotMatched {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:1".parse().unwrap(),
        };
        assert!(not_matched.is_temporary());
        assert!(!not_matched.is_timeout());

        assert!(!MuxError::ListenerClosed.is_temporary());
        assert!(!MuxError::ServerClosed.is_temporary());
        assert!(MuxError::Accept(io::Error::from(io::ErrorKind::ConnectionReset)).is_temporary());
        assert!(!MuxError::Accept(io::Error::from(io::ErrorKind::InvalidInput)).is_temporary());
        assert!(MuxError::ShutdownTimeout { remaining: 1 }.is_timeout());
    }

    #[test]
    fn abort_payload_is_silent() {
        let abort: Box<dyn std::any::Any + Send> = Box::new(AbortHandler);
        assert_eq!(panic_message(abort.as_ref()), None);

        let text: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()).as_deref(), Some("boom"));

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()).as_deref(), Some("bang"));
    }
}
