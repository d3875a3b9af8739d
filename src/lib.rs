//! Protocol multiplexer: serve several protocols from one listener.
//!
//! Connections are sniffed against ordered matcher groups; the first group
//! that recognises the leading bytes receives the connection, with those
//! bytes replayed, through its own [`SubListener`](mux::SubListener).

pub mod config;
pub mod lifecycle;
pub mod matching;
pub mod mux;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod services;

pub use config::MuxConfig;
pub use lifecycle::Shutdown;
pub use mux::{AbortHandler, Multiplexer, MuxConn, MuxError, SubListener};
