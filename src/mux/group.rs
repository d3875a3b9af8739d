//! Matcher groups.

use crate::matching::BoxMatcher;
use crate::mux::sub_listener::SubListener;
use crate::net::ReplayConn;

/// Alternative matchers sharing one destination.
///
/// Immutable once registered. `index` is the registration position and
/// doubles as the group's priority (lower wins).
#[derive(Debug)]
pub struct MatcherGroup {
    index: usize,
    matchers: Vec<BoxMatcher>,
    target: SubListener,
}

impl MatcherGroup {
    pub(crate) fn new(index: usize, matchers: Vec<BoxMatcher>, target: SubListener) -> Self {
        Self { index, matchers, target }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn target(&self) -> &SubListener {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// True if any matcher claims `conn`. Each matcher sniffs from byte zero.
    pub async fn matches(&self, conn: &mut ReplayConn) -> bool {
        for matcher in &self.matchers {
            let mut sniffer = conn.start_sniffing();
            if matcher.matches(&mut sniffer).await {
                tracing::trace!(group = self.index, matcher = ?matcher, "Matcher claimed connection");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::matching::matcher::test_support::conn_with;
    use crate::matching::{any, prefix};
    use crate::net::connection::ConnectionTracker;

    fn group(matchers: Vec<BoxMatcher>) -> MatcherGroup {
        let target = SubListener::new(0, 1, Shutdown::new(), ConnectionTracker::new());
        MatcherGroup::new(0, matchers, target)
    }

    #[tokio::test]
    async fn later_matcher_sees_bytes_read_by_earlier_one() {
        let group = group(vec![prefix(&["SSH-"]), prefix(&["GET "])]);
        let mut conn = conn_with(b"GET / HTTP/1.1\r\n").await;

        assert!(group.matches(&mut conn).await);
        assert!(conn.buffered().starts_with(b"GET "));
    }

    #[tokio::test]
    async fn no_matcher_means_no_match() {
        let group = group(vec![prefix(&["SSH-"]), prefix(&["RFB "])]);
        let mut conn = conn_with(b"\x16\x03\x01").await;
        assert!(!group.matches(&mut conn).await);
    }

    #[tokio::test]
    async fn catch_all_group_reads_nothing() {
        let group = group(vec![any()]);
        let mut conn = conn_with(b"anything").await;
        assert!(group.matches(&mut conn).await);
        assert!(conn.buffered().is_empty());
    }
}
