//! TLS record-header matcher.
//!
//! Only the first three bytes are inspected: a handshake record (content type
//! 0x16) carrying one of the accepted record versions. The handshake itself
//! is left to whoever accepts the connection.

use crate::matching::matcher::{matcher_fn, BoxMatcher};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// SSL 3.0 through TLS 1.3 record versions.
pub const DEFAULT_TLS_VERSIONS: &[u16] = &[0x0300, 0x0301, 0x0302, 0x0303, 0x0304];

/// Match TLS connections whose record version is in `versions`.
/// An empty slice means [`DEFAULT_TLS_VERSIONS`].
pub fn tls(versions: &[u16]) -> BoxMatcher {
    let versions = if versions.is_empty() {
        DEFAULT_TLS_VERSIONS.to_vec()
    } else {
        versions.to_vec()
    };
    matcher_fn(3, move |buf| record_verdict(buf, &versions))
}

fn record_verdict(buf: &[u8], versions: &[u16]) -> Option<bool> {
    match buf {
        [] => None,
        [first, ..] if *first != CONTENT_TYPE_HANDSHAKE => Some(false),
        [_, major, minor, ..] => Some(versions.contains(&u16::from_be_bytes([*major, *minor]))),
        _ => None,
    }
}
