//! Built-in HTTP service.
//!
//! # Responsibilities
//! - Create Axum Router with the built-in handlers
//! - Wire up middleware (tracing, request timeout)
//! - Serve it from a sub-listener until the multiplexer closes

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{connect_info::Connected, ConnectInfo},
    routing::{get, post},
    serve::IncomingStream,
    Json, Router,
};
use serde::Serialize;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::lifecycle::Shutdown;
use crate::mux::SubListener;

/// Peer address of a connection served from a sub-listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, SubListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, SubListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

#[derive(Debug, Serialize)]
struct Info {
    service: &'static str,
    version: &'static str,
    peer_addr: String,
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn router(request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(info))
        .route("/health", get(health))
        .route("/echo", post(echo))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: SubListener, router: Router, shutdown: Shutdown) -> std::io::Result<()> {
    let group = listener.group();
    tracing::info!(group, "HTTP service starting");

    axum::serve(listener, router.into_make_service_with_connect_info::<PeerAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(group, "HTTP service stopped");
    Ok(())
}

async fn info(ConnectInfo(PeerAddr(peer_addr)): ConnectInfo<PeerAddr>) -> Json<Info> {
    Json(Info {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        peer_addr: peer_addr.to_string(),
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn echo(body: Bytes) -> Bytes {
    body
}
