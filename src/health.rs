//! HTTP health probe
//!
//! Optional single-endpoint server: `GET /health` returns process uptime
//! and the current session's metrics snapshot. Everything else is 404.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::metrics::{names, Metrics, MetricsSnapshot};
use crate::Result;

/// Shared state for the health endpoint
#[derive(Clone)]
pub struct HealthState {
    pub started_at: Instant,
    pub metrics: Arc<Metrics>,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Seconds since process start
    uptime: u64,
    #[serde(rename = "currentSession")]
    current_session: SessionHealth,
}

#[derive(Serialize)]
struct SessionHealth {
    /// Seconds the current session has been connected
    duration: i64,
    metrics: MetricsSnapshot,
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let snapshot = state.metrics.snapshot();
    let duration = snapshot
        .gauges
        .get(names::SESSION_DURATION_SEC)
        .copied()
        .unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        current_session: SessionHealth {
            duration,
            metrics: snapshot,
        },
    })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Build the health router
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

/// Bind the probe and serve it in a background task
///
/// # Errors
///
/// Returns error if the port cannot be bound.
pub async fn serve(port: u16, state: HealthState) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "health probe listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!(error = %e, "health probe server failed");
        }
    }))
}
