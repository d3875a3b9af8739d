//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! multiplexer. All types derive Serde traits for deserialization from
//! config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::matching::{self, BoxMatcher};

/// Root configuration for the multiplexer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MuxConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Sniffing and service timeouts.
    pub timeouts: TimeoutConfig,

    /// Sub-listener queue settings.
    pub queue: QueueConfig,

    /// Accept-loop retry curve.
    pub backoff: BackoffConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Matcher groups in priority order.
    pub groups: GroupList,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration. When set, TLS is terminated before sniffing.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for matchers to reach a verdict, in milliseconds. 0 disables it.
    pub read_timeout_ms: u64,

    /// Per-request timeout of the built-in HTTP service, in seconds.
    pub request_secs: u64,
}

impl TimeoutConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            request_secs: 30,
        }
    }
}

/// Sub-listener queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Matched connections a sub-listener holds before handoffs block.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Backoff applied to transient accept errors.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub base_ms: u64,

    /// Upper bound in milliseconds.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_ms: 5, max_ms: 1000 }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long `shutdown` waits for busy connections, in seconds.
    pub grace_period_secs: u64,

    /// How often idle connections are swept during shutdown, in milliseconds.
    pub poll_interval_ms: u64,

    /// Connections never sniffed for this long count as idle, in seconds.
    pub new_idle_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            poll_interval_ms: 500,
            new_idle_secs: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "protomux=debug".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Matcher groups, highest priority first.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct GroupList(pub Vec<GroupConfig>);

impl Default for GroupList {
    /// HTTP/1 to the HTTP service, everything else echoed.
    fn default() -> Self {
        Self(vec![
            GroupConfig {
                name: "http".to_string(),
                matchers: vec![MatcherSpec::Http1Fast { extra_methods: Vec::new() }],
                service: ServiceKind::Http,
            },
            GroupConfig {
                name: "fallback".to_string(),
                matchers: vec![MatcherSpec::Any],
                service: ServiceKind::Echo,
            },
        ])
    }
}

impl std::ops::Deref for GroupList {
    type Target = [GroupConfig];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// One matcher group and the service fed by it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Group identifier for logging.
    pub name: String,

    /// Alternative matchers; any one of them claims the connection.
    pub matchers: Vec<MatcherSpec>,

    /// Built-in service that accepts from the group's sub-listener.
    pub service: ServiceKind,
}

/// Declarative form of the built-in matchers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherSpec {
    Any,
    Prefix {
        patterns: Vec<String>,
    },
    Http1Fast {
        #[serde(default)]
        extra_methods: Vec<String>,
    },
    Http1,
    Http2,
    Http1HeaderField {
        name: String,
        value: String,
    },
    Http1HeaderFieldPrefix {
        name: String,
        prefix: String,
    },
    Tls {
        #[serde(default)]
        versions: Vec<u16>,
    },
}

impl MatcherSpec {
    pub fn build(&self) -> BoxMatcher {
        match self {
            MatcherSpec::Any => matching::any(),
            MatcherSpec::Prefix { patterns } => matching::prefix(patterns),
            MatcherSpec::Http1Fast { extra_methods } => {
                let extra: Vec<&str> = extra_methods.iter().map(String::as_str).collect();
                matching::http1_fast(&extra)
            }
            MatcherSpec::Http1 => matching::http1(),
            MatcherSpec::Http2 => matching::http2(),
            MatcherSpec::Http1HeaderField { name, value } => matching::http1_header_field(name, value),
            MatcherSpec::Http1HeaderFieldPrefix { name, prefix } => {
                matching::http1_header_field_prefix(name, prefix)
            }
            MatcherSpec::Tls { versions } => matching::tls(versions),
        }
    }

    /// Claims every connection without reading.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, MatcherSpec::Any)
    }
}

/// Built-in services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// axum router with health and info endpoints.
    Http,
    /// Writes back every byte it reads.
    Echo,
}
