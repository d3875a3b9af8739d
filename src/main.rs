//! protomux: one port, several protocols.
//!
//! ```text
//!                        ┌───────────────────────────────────────────────┐
//!                        │                 MULTIPLEXER                    │
//!                        │                                                │
//!   Client connection    │  ┌─────────┐    ┌──────────┐    ┌───────────┐  │
//!   ─────────────────────┼─▶│   net   │───▶│ matching │───▶│    mux    │  │
//!                        │  │listener │    │ (sniff)  │    │  groups   │  │
//!                        │  └─────────┘    └──────────┘    └─────┬─────┘  │
//!                        │                                       │        │
//!                        │                  ┌────────────────────┼──────┐ │
//!                        │                  ▼                    ▼      │ │
//!                        │           ┌────────────┐      ┌────────────┐ │ │
//!                        │           │sub-listener│      │sub-listener│ │ │
//!                        │           │  (http)    │      │  (echo)    │ │ │
//!                        │           └─────┬──────┘      └─────┬──────┘ │ │
//!                        │                 ▼                   ▼        │ │
//!                        │           axum router          echo task     │ │
//!                        │                                              │ │
//!                        │  config · lifecycle · observability · resilience
//!                        └───────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use protomux::config::{load_config, MuxConfig};
use protomux::lifecycle::{signals::shutdown_signal, Shutdown};
use protomux::observability::{logging, metrics};
use protomux::{services, Multiplexer, MuxError};

#[derive(Debug, Parser)]
#[command(name = "protomux")]
#[command(about = "Serve several protocols from one listener", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MuxConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability.log_filter)?;
    tracing::info!("protomux v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        groups = config.groups.len(),
        tls = config.listener.tls.is_some(),
        queue_capacity = config.queue.capacity,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let root = Shutdown::new();
    let mux = Multiplexer::with_config(&root, &config);
    // Services drain when asked to, and at the latest when the multiplexer closes.
    let draining = mux.scope().child();
    let services = services::attach(&mux, &config, &draining);

    let server = {
        let mux = mux.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let addr = &config.listener.bind_address;
            match &config.listener.tls {
                Some(tls) => mux.listen_and_serve_tls(addr, &tls.cert_path, &tls.key_path).await,
                None => mux.listen_and_serve(addr).await,
            }
        })
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        result = server => {
            match result {
                Ok(Err(MuxError::ServerClosed)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Multiplexer stopped"),
                Ok(Ok(())) => {}
                Err(e) => tracing::error!(error = %e, "Multiplexer task failed"),
            }
        }
    }

    draining.trigger();
    let grace = Duration::from_secs(config.shutdown.grace_period_secs);
    if let Err(e) = mux.shutdown(grace).await {
        tracing::warn!(error = %e, "Forcing close");
        mux.close().await;
    }
    root.trigger();

    for service in services {
        let _ = service.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
