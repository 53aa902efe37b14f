//! HTTP serving surfaces: Prometheus metrics and health probes.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tracing::info;

use crate::controller::metrics::REGISTRY;
use crate::error::Result;

/// Metrics endpoint handler
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY).unwrap();
    buffer
}

async fn probe_handler() -> &'static str {
    "ok"
}

/// Serves `/metrics` in Prometheus text format.
pub async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serves the liveness and readiness probes.
pub async fn run_probe_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(probe_handler))
        .route("/readyz", get(probe_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "probe server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
