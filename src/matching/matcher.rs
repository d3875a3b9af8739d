//! Matcher contract and the generic incremental sniffing driver.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::net::Sniffer;

/// Upper bound for a single sniffing read.
const READ_CHUNK: usize = 1024;

/// Decides whether a connection belongs to a protocol.
///
/// Implementations read through the [`Sniffer`], which buffers everything so
/// later matchers and the final consumer still see the bytes. A read error
/// (EOF, reset, the sniff deadline) must be answered with `false`.
#[async_trait]
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the connection matches this condition.
    async fn matches(&self, io: &mut Sniffer<'_>) -> bool;
}

pub type BoxMatcher = Box<dyn Matcher>;

/// Log a failed sniffing read. Timeouts and hard errors only differ here.
pub(crate) fn log_sniff_error(matcher: &str, io: &Sniffer<'_>, e: &io::Error) {
    if e.kind() == io::ErrorKind::TimedOut {
        tracing::debug!(matcher, peer_addr = %io.peer_addr(), "Sniff deadline exceeded");
    } else {
        tracing::debug!(matcher, peer_addr = %io.peer_addr(), error = %e, "Sniff read failed");
    }
}

/// Read incrementally until `verdict` decides or `max_len` bytes were seen.
///
/// `verdict` gets every byte read so far and returns `None` while it needs
/// more input. Hitting `max_len`, EOF or a read error without a verdict
/// counts as no match.
pub async fn sniff_with<F>(name: &str, io: &mut Sniffer<'_>, max_len: usize, verdict: F) -> bool
where
    F: Fn(&[u8]) -> Option<bool>,
{
    sniff_until_eof(name, io, max_len, verdict, |_| false).await
}

/// Like [`sniff_with`], but a clean end of stream without a verdict is
/// settled by `at_eof` over the bytes seen so far. Read errors still count
/// as no match.
pub async fn sniff_until_eof<F, E>(name: &str, io: &mut Sniffer<'_>, max_len: usize, verdict: F, at_eof: E) -> bool
where
    F: Fn(&[u8]) -> Option<bool>,
    E: Fn(&[u8]) -> bool,
{
    let mut buf = Vec::with_capacity(max_len.min(READ_CHUNK));
    loop {
        if let Some(decided) = verdict(&buf) {
            return decided;
        }
        if buf.len() >= max_len {
            return false;
        }

        let start = buf.len();
        let want = (max_len - start).min(READ_CHUNK);
        buf.resize(start + want, 0);
        match io.read(&mut buf[start..]).await {
            Ok(0) => {
                buf.truncate(start);
                tracing::trace!(matcher = name, read = buf.len(), "EOF before a verdict");
                return at_eof(&buf);
            }
            Ok(n) => buf.truncate(start + n),
            Err(e) => {
                log_sniff_error(name, io, &e);
                return false;
            }
        }
    }
}

/// Matches every connection. Register it last.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMatcher;

#[async_trait]
impl Matcher for AnyMatcher {
    async fn matches(&self, _io: &mut Sniffer<'_>) -> bool {
        true
    }
}

/// Catch-all matcher.
pub fn any() -> BoxMatcher {
    Box::new(AnyMatcher)
}

/// Adapts a byte predicate into a [`Matcher`].
pub struct FnMatcher<F> {
    max_len: usize,
    predicate: F,
}

impl<F> fmt::Debug for FnMatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMatcher").field("max_len", &self.max_len).finish()
    }
}

#[async_trait]
impl<F> Matcher for FnMatcher<F>
where
    F: Fn(&[u8]) -> Option<bool> + Send + Sync,
{
    async fn matches(&self, io: &mut Sniffer<'_>) -> bool {
        sniff_with("fn", io, self.max_len, &self.predicate).await
    }
}

/// Build a matcher from a predicate over the leading bytes.
///
/// The predicate returns `Some(verdict)` once it can decide and `None` to ask
/// for more input; at most `max_len` bytes are ever read.
pub fn matcher_fn<F>(max_len: usize, predicate: F) -> BoxMatcher
where
    F: Fn(&[u8]) -> Option<bool> + Send + Sync + 'static,
{
    Box::new(FnMatcher { max_len, predicate })
}


#[cfg(test)]
mod tests {
    use super::test_support::conn_with;
    use super::*;

    #[tokio::test]
    async fn any_matches_empty_stream() {
        let mut conn = conn_with(b"").await;
        assert!(any().matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn fn_matcher_reads_until_decided() {
        let starts_with_magic = matcher_fn(8, |buf| {
            if buf.len() < 4 {
                None
            } else {
                Some(&buf[..4] == b"MAGI")
            }
        });

        let mut conn = conn_with(b"MAGIC!").await;
        assert!(starts_with_magic.matches(&mut conn.start_sniffing()).await);

        let mut conn = conn_with(b"MAG").await;
        assert!(!starts_with_magic.matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn fn_matcher_gives_up_at_max_len() {
        let never = matcher_fn(4, |_| None);
        let mut conn = conn_with(b"0123456789").await;
        assert!(!never.matches(&mut conn.start_sniffing()).await);
        assert!(conn.buffered().len() <= 4);
    }
}
