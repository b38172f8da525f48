//! HTTP exposition of [`global_metrics`] for scraping.

use std::io;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;

use crate::metrics::global_metrics;

/// `/metrics` in prometheus text format plus a `/healthz` liveness check.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
}

/// Bind `addr` and serve [`metrics_router`] until the server stops.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router())
        .await
        .map_err(io::Error::other)
}

async fn render_metrics() -> String {
    global_metrics().render_prometheus()
}

async fn healthz() -> &'static str {
    "ok"
}
