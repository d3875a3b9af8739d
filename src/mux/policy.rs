//! Error-continuation policy.
//!
//! Every error the multiplexer cannot hand back to a caller synchronously
//! (unmatched connections, accept failures) goes through the policy. Its
//! answer decides whether serving continues.

use std::sync::Arc;

use crate::mux::error::MuxError;

/// Returns `true` to keep serving after `err`.
pub type ErrorPolicy = Arc<dyn Fn(&MuxError) -> bool + Send + Sync>;

/// Keep running for everything except fatal listener errors.
pub fn default_policy(err: &MuxError) -> bool {
    match err {
        MuxError::NotMatched { peer_addr, .. } => {
            tracing::debug!(peer_addr = %peer_addr, "Closing unmatched connection");
            true
        }
        MuxError::Accept(_) => err.is_temporary(),
        MuxError::ListenerClosed | MuxError::ServerClosed => false,
        _ => true,
    }
}

pub(crate) fn default_error_policy() -> ErrorPolicy {
    Arc::new(default_policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ConnectionId;
    use std::io;

    #[test]
    fn default_policy_stops_only_on_fatal_errors() {
        let unmatched = MuxError::NotMatched {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:1".parse().unwrap(),
        };
        assert!(default_policy(&unmatched));
        assert!(default_policy(&MuxError::Accept(io::Error::from(io::ErrorKind::ConnectionAborted))));
        assert!(!default_policy(&MuxError::Accept(io::Error::from(io::ErrorKind::PermissionDenied))));
        assert!(!default_policy(&MuxError::ListenerClosed));
    }
}
