//! Protocol matching subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (ReplayConn)
//!     → group 1: matcher a, matcher b ...   (OR within a group)
//!     → group 2: ...                        (first matching group wins)
//!     → Return: matched group or NoMatch
//!
//! Every matcher starts from byte zero of the sniff buffer.
//! ```
//!
//! # Design Decisions
//! - Matchers are compiled once at registration, immutable afterwards
//! - Prefix tries rather than regex; reads stop at the first decisive byte
//! - Read errors mean "no match"; the multiplexer's sniff deadline bounds reads
//! - Deterministic: same input always matches the same group

pub mod http;
pub mod matcher;
pub mod prefix;
pub mod tls;

pub use http::{http1, http1_fast, http1_header_field, http1_header_field_prefix, http2};
pub use matcher::{any, matcher_fn, sniff_until_eof, sniff_with, AnyMatcher, BoxMatcher, FnMatcher, Matcher};
pub use prefix::{prefix, PrefixMatcher, PrefixTree};
pub use tls::tls;
