//! Session metrics and the optional HTTP endpoint exposing them.
//!
//! Both series are written only by the backend supervisor: the counter on
//! every backend that reaches readiness, the gauge on readiness and on reap.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::session::SessionTable;

/// Counters observed by the metrics endpoint.
pub struct Metrics {
    registry: Registry,
    /// Backends that reached readiness since startup.
    pub sessions_started: IntCounter,
    /// Backends whose process has not exited yet.
    pub sessions_active: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_started = IntCounter::new(
            "iperf_lb_sessions_started_total",
            "Total number of backend sessions started",
        )?;
        let sessions_active = IntGauge::new(
            "iperf_lb_sessions_active",
            "Number of backend sessions currently running",
        )?;

        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            registry,
            sessions_started,
            sessions_active,
        })
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Clone)]
struct EndpointState {
    metrics: Arc<Metrics>,
    table: Arc<SessionTable>,
}

/// Routes served by the metrics endpoint.
pub fn routes(metrics: Arc<Metrics>, table: Arc<SessionTable>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/sessions", get(list_sessions))
        .with_state(EndpointState { metrics, table })
}

async fn render_metrics(State(state): State<EndpointState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_sessions(State(state): State<EndpointState>) -> impl IntoResponse {
    Json(state.table.snapshot().await)
}

/// Bind the metrics endpoint. Binding errors are returned to the caller,
/// serving runs in the background for the life of the process.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    table: Arc<SessionTable>,
) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(bind_addr = %local_addr, "Metrics endpoint listening");

    let app = routes(metrics, table);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics endpoint failed");
        }
    });

    Ok(local_addr)
}
