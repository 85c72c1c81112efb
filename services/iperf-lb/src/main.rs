//! iperf-lb
//!
//! Session-affine router for iperf3 bandwidth tests.
//!
//! This service:
//! - Accepts iperf3 clients on a single listening address
//! - Reads the test cookie each client sends first
//! - Spawns a one-off iperf3 server per cookie on its own local port
//! - Relays every connection of a test to that server
//! - Removes the session once the server exits

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use iperf_lb::{
    metrics, BackendSupervisor, Config, Listener, LogFormat, Metrics, SessionRouter, SessionTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    config.validate()?;

    info!("Starting iperf-lb");
    info!(
        listen = %config.listen,
        dial_timeout_ms = config.dial_timeout_ms,
        port_floor = config.port_floor,
        backend_program = %config.backend_program,
        metrics_enabled = config.metrics,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let table = Arc::new(SessionTable::with_port_floor(config.port_floor));
    let supervisor = Arc::new(BackendSupervisor::new(
        config.backend_config(),
        Arc::clone(&table),
        Arc::clone(&metrics),
    ));
    let router = Arc::new(SessionRouter::with_backend_host(
        Arc::clone(&table),
        supervisor,
        config.backend_host.clone(),
    ));

    if config.metrics {
        metrics::serve(config.metrics_listen, Arc::clone(&metrics), Arc::clone(&table))
            .await
            .with_context(|| format!("failed to bind metrics endpoint on {}", config.metrics_listen))?;
    }

    let listener = match Listener::bind(config.listener_config(), router).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen, error = %e, "Failed to bind listener");
            return Err(e).with_context(|| format!("error listening on {}", config.listen));
        }
    };

    listener
        .run()
        .await
        .context("error accepting connection")
}
