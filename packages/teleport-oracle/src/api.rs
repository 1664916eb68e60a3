//! Health & status API
//!
//! - GET /health  - liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status  - relay record counts by status and the replay cursor

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ledger::RelayLedger;
use crate::metrics;
use crate::types::StatusCounts;

#[derive(Clone)]
pub struct AppState {
    ledger: Arc<dyn RelayLedger>,
    started: Instant,
}

impl AppState {
    pub fn new(ledger: Arc<dyn RelayLedger>) -> Self {
        Self {
            ledger,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    records: StatusCounts,
    cursor: Option<u64>,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn prometheus_metrics() -> Response {
    match metrics::encode() {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Response {
    let counts = state.ledger.status_counts().await;
    let cursor = state.ledger.load_cursor().await;
    match (counts, cursor) {
        (Ok(records), Ok(cursor)) => Json(StatusResponse {
            records,
            cursor,
            uptime_seconds: state.started.elapsed().as_secs(),
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to read relay ledger status");
            (StatusCode::SERVICE_UNAVAILABLE, "ledger unavailable").into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve on an already-bound listener until cancelled
pub async fn serve_listener(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status API listening on {}", addr);
    info!("  /health  - Liveness (JSON)");
    info!("  /metrics - Prometheus metrics");
    info!("  /status  - Relay record counts (JSON)");
    serve_listener(listener, state, cancel).await
}
