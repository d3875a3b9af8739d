//! HTTP matchers.
//!
//! Two speeds are offered for HTTP/1:
//! - `http1_fast` only looks at the method token. Cheap, but anything that
//!   happens to start with `GET` passes.
//! - `http1` parses the whole request line and checks the version.
//!
//! Header matchers parse one complete request head with `httparse` and
//! compare a single header.

use crate::matching::matcher::{matcher_fn, BoxMatcher};
use crate::matching::prefix::prefix;

/// Methods recognised by [`http1_fast`].
pub const DEFAULT_HTTP_METHODS: &[&str] = &[
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT", "PATCH",
];

/// Client connection preface every HTTP/2 connection starts with.
pub const HTTP2_PREFACE: &str = "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Longest request line [`http1`] will read.
pub const MAX_REQUEST_LINE: usize = 4096;

/// Largest request head the header matchers will read.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Fast HTTP/1 match on the method token (plus any extra methods).
pub fn http1_fast(extra_methods: &[&str]) -> BoxMatcher {
    prefix(DEFAULT_HTTP_METHODS.iter().chain(extra_methods.iter()))
}

/// HTTP/2 prior-knowledge (h2c) connections.
pub fn http2() -> BoxMatcher {
    prefix([HTTP2_PREFACE])
}

/// Full HTTP/1.0 or HTTP/1.1 request line.
pub fn http1() -> BoxMatcher {
    matcher_fn(MAX_REQUEST_LINE, request_line_verdict)
}

/// Request whose `name` header equals `value`.
pub fn http1_header_field(name: &str, value: &str) -> BoxMatcher {
    let name = name.to_string();
    let value = value.to_string();
    matcher_fn(MAX_REQUEST_HEAD, move |buf| {
        header_verdict(buf, &name, |found| found == value.as_bytes())
    })
}

/// Request whose `name` header starts with `prefix`.
pub fn http1_header_field_prefix(name: &str, prefix: &str) -> BoxMatcher {
    let name = name.to_string();
    let prefix = prefix.to_string();
    matcher_fn(MAX_REQUEST_HEAD, move |buf| {
        header_verdict(buf, &name, |found| found.starts_with(prefix.as_bytes()))
    })
}

fn request_line_verdict(buf: &[u8]) -> Option<bool> {
    let line_end = match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None if buf.len() >= MAX_REQUEST_LINE => return Some(false),
        None => return None,
    };

    // No header slots: a lone request line parses as Partial once the version is known.
    let mut headers = [httparse::EMPTY_HEADER; 0];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf[..line_end]) {
        Ok(_) => Some(req.method.is_some() && req.path.is_some() && req.version.is_some()),
        Err(e) => {
            tracing::trace!(error = %e, "Not an HTTP/1 request line");
            Some(false)
        }
    }
}

fn header_verdict<F>(buf: &[u8], name: &str, accept: F) -> Option<bool>
where
    F: Fn(&[u8]) -> bool,
{
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {
            let found = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.trim_ascii());
            Some(found.is_some_and(accept))
        }
        Ok(httparse::Status::Partial) => None,
        Err(e) => {
            tracing::trace!(error = %e, header = name, "Request head did not parse");
            Some(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::matcher::test_support::conn_with;
    use crate::matching::matcher::Matcher;

    #[test]
    fn request_line_verdicts() {
        assert_eq!(request_line_verdict(b"GET / HTTP/1.1\r\n"), Some(true));
        assert_eq!(request_line_verdict(b"POST /a?b=c HTTP/1.0\r\nHost: x\r\n"), Some(true));
        assert_eq!(request_line_verdict(b"GET / HTTP/1.1"), None);
        assert_eq!(request_line_verdict(b"GET / HTTP/2.0\r\n"), Some(false));
        assert_eq!(request_line_verdict(b"SSH-2.0-OpenSSH_9.6\r\n"), Some(false));
    }

    #[test]
    fn overlong_request_line_is_rejected() {
        let line = vec![b'A'; MAX_REQUEST_LINE];
        assert_eq!(request_line_verdict(&line), Some(false));
    }

    #[test]
    fn header_verdict_waits_for_complete_head() {
        let head = b"GET / HTTP/1.1\r\nContent-Type: application/grpc\r\n";
        assert_eq!(header_verdict(head, "content-type", |v| v == b"application/grpc"), None);

        let head = b"GET / HTTP/1.1\r\nContent-Type:  application/grpc \r\n\r\n";
        assert_eq!(header_verdict(head, "content-type", |v| v == b"application/grpc"), Some(true));
        assert_eq!(header_verdict(head, "x-missing", |_| true), Some(false));
    }

    #[tokio::test]
    async fn fast_matcher_accepts_known_and_extra_methods() {
        let mut conn = conn_with(b"GET /x HTTP/1.1\r\n").await;
        assert!(http1_fast(&[]).matches(&mut conn.start_sniffing()).await);

        let mut conn = conn_with(b"PROPFIND /dav HTTP/1.1\r\n").await;
        assert!(!http1_fast(&[]).matches(&mut conn.start_sniffing()).await);
        assert!(http1_fast(&["PROPFIND"]).matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn fast_matcher_accepts_false_positive_full_matcher_rejects() {
        let mut conn = conn_with(b"GETAWAY car\r\n").await;
        assert!(http1_fast(&[]).matches(&mut conn.start_sniffing()).await);
        assert!(!http1().matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn http2_preface() {
        let mut conn = conn_with(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n\x00\x00").await;
        assert!(http2().matches(&mut conn.start_sniffing()).await);
        assert!(!http1().matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn header_field_matchers() {
        let request = b"POST /svc HTTP/1.1\r\nHost: a\r\ncontent-type: application/grpc+proto\r\n\r\n";

        let mut conn = conn_with(request).await;
        assert!(!http1_header_field("Content-Type", "application/grpc").matches(&mut conn.start_sniffing()).await);
        assert!(http1_header_field_prefix("Content-Type", "application/grpc").matches(&mut conn.start_sniffing()).await);
        assert!(http1_header_field("host", "a").matches(&mut conn.start_sniffing()).await);
    }
}
