//! Built-in protocol services fed by sub-listeners.
//!
//! # Data Flow
//! ```text
//! MuxConfig.groups[i]
//!     → Multiplexer::match_group(matchers)  → SubListener
//!     → spawn(service, sub_listener)        → http (axum) | echo
//! ```

pub mod echo;
pub mod http;

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{MuxConfig, ServiceKind};
use crate::lifecycle::Shutdown;
use crate::mux::{Multiplexer, SubListener};

/// Run the service `kind` on `listener` in the background.
///
/// `stop` starts a graceful drain of services that support one (HTTP).
pub fn spawn(kind: ServiceKind, listener: SubListener, config: &MuxConfig, stop: &Shutdown) -> JoinHandle<()> {
    match kind {
        ServiceKind::Http => {
            let router = http::router(Duration::from_secs(config.timeouts.request_secs));
            let shutdown = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = http::serve(listener, router, shutdown).await {
                    tracing::error!(error = %e, "HTTP service failed");
                }
            })
        }
        ServiceKind::Echo => tokio::spawn(echo::serve(listener)),
    }
}

/// Register every configured group, in order, and start its service.
pub fn attach(mux: &Multiplexer, config: &MuxConfig, stop: &Shutdown) -> Vec<JoinHandle<()>> {
    config
        .groups
        .iter()
        .map(|group| {
            let listener = mux.match_group(group.matchers.iter().map(|m| m.build()));
            tracing::info!(
                group = listener.group(),
                name = %group.name,
                matchers = group.matchers.len(),
                service = ?group.service,
                "Group attached"
            );
            spawn(group.service, listener, config, stop)
        })
        .collect()
}
