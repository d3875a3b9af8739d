//! Prefix matching over the leading bytes of a connection.
//!
//! Patterns are compiled once into a byte trie; matching walks the trie as
//! bytes arrive and stops at the first decisive byte, so it never reads more
//! than the longest pattern.

use async_trait::async_trait;

use crate::matching::matcher::{sniff_until_eof, BoxMatcher, Matcher};
use crate::net::Sniffer;

#[derive(Debug, Default)]
struct Node {
    children: Vec<(u8, Node)>,
    terminal: bool,
}

impl Node {
    fn child(&self, byte: u8) -> Option<&Node> {
        self.children.iter().find(|(b, _)| *b == byte).map(|(_, n)| n)
    }

    fn child_mut(&mut self, byte: u8) -> &mut Node {
        let idx = match self.children.iter().position(|(b, _)| *b == byte) {
            Some(idx) => idx,
            None => {
                self.children.push((byte, Node::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[idx].1
    }
}

/// Byte trie over a fixed set of patterns.
#[derive(Debug, Default)]
pub struct PrefixTree {
    root: Node,
    max_len: usize,
}

impl PrefixTree {
    /// Compile `patterns`. Empty patterns are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut tree = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            let mut node = &mut tree.root;
            for &byte in pattern {
                node = node.child_mut(byte);
            }
            node.terminal = true;
            tree.max_len = tree.max_len.max(pattern.len());
        }
        tree
    }

    /// Length of the longest pattern.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_empty(&self) -> bool {
        self.max_len == 0
    }

    /// Decide whether `input` starts with one of the patterns.
    ///
    /// `Some(true)` once a pattern is fully contained, `Some(false)` once no
    /// pattern can match any more, `None` while `input` is still a strict
    /// prefix of some pattern.
    pub fn walk(&self, input: &[u8]) -> Option<bool> {
        if self.is_empty() {
            return Some(false);
        }
        let mut node = &self.root;
        for &byte in input {
            node = match node.child(byte) {
                Some(next) => next,
                None => return Some(false),
            };
            if node.terminal {
                return Some(true);
            }
        }
        None
    }

    /// True if `input` is non-empty and could still grow into a pattern, or
    /// already starts with one.
    pub fn is_live(&self, input: &[u8]) -> bool {
        !input.is_empty() && self.walk(input) != Some(false)
    }
}

/// Matches connections whose first bytes equal one of the patterns.
#[derive(Debug)]
pub struct PrefixMatcher {
    tree: PrefixTree,
}

impl PrefixMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            tree: PrefixTree::new(patterns),
        }
    }
}

#[async_trait]
impl Matcher for PrefixMatcher {
    async fn matches(&self, io: &mut Sniffer<'_>) -> bool {
        // A stream that ends on a pattern's path counts as that pattern.
        sniff_until_eof(
            "prefix",
            io,
            self.tree.max_len(),
            |buf| self.tree.walk(buf),
            |buf| self.tree.is_live(buf),
        )
        .await
    }
}

/// Match any of the given prefixes.
pub fn prefix<I, S>(patterns: I) -> BoxMatcher
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    Box::new(PrefixMatcher::new(patterns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::matcher::test_support::conn_with;

    #[test]
    fn walk_decides_as_early_as_possible() {
        let tree = PrefixTree::new(["POST", "PUT", "PATCH"]);
        assert_eq!(tree.max_len(), 5);
        assert_eq!(tree.walk(b""), None);
        assert_eq!(tree.walk(b"P"), None);
        assert_eq!(tree.walk(b"PU"), None);
        assert_eq!(tree.walk(b"PUT"), Some(true));
        assert_eq!(tree.walk(b"PUT /"), Some(true));
        assert_eq!(tree.walk(b"PA"), None);
        assert_eq!(tree.walk(b"GET"), Some(false));
        assert_eq!(tree.walk(b"POX"), Some(false));
    }

    #[test]
    fn shorter_pattern_wins_over_longer_one() {
        let tree = PrefixTree::new(["AB", "ABCD"]);
        assert_eq!(tree.walk(b"ABX"), Some(true));
    }

    #[test]
    fn empty_pattern_set_never_matches() {
        let tree = PrefixTree::new(Vec::<&str>::new());
        assert!(tree.is_empty());
        assert_eq!(tree.walk(b"anything"), Some(false));
        let tree = PrefixTree::new([""]);
        assert_eq!(tree.walk(b"anything"), Some(false));
    }

    #[tokio::test]
    async fn prefix_matcher_leaves_bytes_for_next_matcher() {
        let mut conn = conn_with(b"GET /x HTTP/1.1\r\n").await;
        let post_or_put = prefix(["POST", "PUT"]);
        let get = prefix(["GET"]);

        assert!(!post_or_put.matches(&mut conn.start_sniffing()).await);
        assert!(get.matches(&mut conn.start_sniffing()).await);
        assert!(conn.buffered().starts_with(b"G"));
    }

    #[tokio::test]
    async fn stream_ending_inside_a_pattern_matches() {
        let mut conn = conn_with(b"PO").await;
        assert!(prefix(["POST"]).matches(&mut conn.start_sniffing()).await);
    }

    #[tokio::test]
    async fn stream_ending_off_every_pattern_does_not_match() {
        let mut conn = conn_with(b"PX").await;
        assert!(!prefix(["POST"]).matches(&mut conn.start_sniffing()).await);

        let mut empty = conn_with(b"").await;
        assert!(!prefix(["POST"]).matches(&mut empty.start_sniffing()).await);
    }

    #[test]
    fn live_prefix_works_both_ways() {
        let tree = PrefixTree::new(["POST", "PUT"]);
        assert!(tree.is_live(b"PO"));
        assert!(tree.is_live(b"POST /x"));
        assert!(!tree.is_live(b"PA"));
        assert!(!tree.is_live(b""));
    }
}
