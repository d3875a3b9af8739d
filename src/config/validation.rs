//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity > 0, 0 < backoff base ≤ max)
//! - Check addresses parse and TLS paths are present
//! - Reject groups that can never be reached
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MuxConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::MuxConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no matcher groups configured")]
    NoGroups,

    #[error("group '{0}' has no matchers")]
    EmptyGroup(String),

    #[error("group '{group}' contains a catch-all matcher but is not the last group")]
    UnreachableGroups { group: String },

    #[error("invalid {field} '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,

    #[error("backoff base must be greater than zero")]
    ZeroBackoff,

    #[error("backoff base {base_ms}ms exceeds max {max_ms}ms")]
    BackoffRange { base_ms: u64, max_ms: u64 },

    #[error("shutdown poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("tls {0} must not be empty")]
    EmptyTlsPath(&'static str),
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &MuxConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "bind address",
            value: config.listener.bind_address.clone(),
        });
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("cert_path"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("key_path"));
        }
    }

    if config.queue.capacity == 0 {
        errors.push(ValidationError::ZeroCapacity);
    }
    if config.backoff.base_ms == 0 {
        errors.push(ValidationError::ZeroBackoff);
    }
    if config.backoff.base_ms > config.backoff.max_ms {
        errors.push(ValidationError::BackoffRange {
            base_ms: config.backoff.base_ms,
            max_ms: config.backoff.max_ms,
        });
    }
    if config.shutdown.poll_interval_ms == 0 {
        errors.push(ValidationError::ZeroPollInterval);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "metrics address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if config.groups.is_empty() {
        errors.push(ValidationError::NoGroups);
    }
    let last = config.groups.len().saturating_sub(1);
    for (i, group) in config.groups.iter().enumerate() {
        if group.matchers.is_empty() {
            errors.push(ValidationError::EmptyGroup(group.name.clone()));
        }
        if i < last && group.matchers.iter().any(|m| m.is_catch_all()) {
            errors.push(ValidationError::UnreachableGroups {
                group: group.name.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
