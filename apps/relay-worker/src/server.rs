//! Health and metrics HTTP server
//!
//! - `/health`, `/healthz` - Liveness probe
//! - `/ready`, `/readyz` - Readiness probe (consumer running)
//! - `/metrics` - Prometheus metrics

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use broker_worker::{EngineState, cancelled, render_metrics};
use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Shared state for the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub name: &'static str,
    pub version: &'static str,
    pub queue: String,
    pub engine: watch::Receiver<EngineState>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    name: &'static str,
    version: &'static str,
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        name: state.name,
        version: state.version,
    })
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let engine = *state.engine.borrow();
    let status = if engine == EngineState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "queue": state.queue,
            "consumer": engine.to_string(),
        })),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_metrics(),
    )
}

pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the health router until shutdown is signalled.
pub async fn serve(state: HealthState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move { cancelled(&mut shutdown).await })
        .await
        .wrap_err("Health server failed")
}
