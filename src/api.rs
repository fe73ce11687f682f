//! Health & status API
//!
//! - GET  /health              - liveness and uptime
//! - GET  /metrics             - Prometheus metrics
//! - GET  /status              - seal counts by status
//! - GET  /seals/{hash}        - one seal's status and error kind
//! - POST /seals/{hash}/cancel - cancel a seal that is still PENDING

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::ledger::SealLedger;
use crate::metrics;
use crate::orchestrator::{CancelError, Orchestrator};
use crate::types::{SealHash, Status};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn SealLedger>,
    pub orchestrator: Arc<Orchestrator>,
    pub started: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            ledger: orchestrator.ledger().clone(),
            orchestrator,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub seals: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

pub async fn prometheus_metrics() -> Response {
    match metrics::gather_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        ),
    }
}

pub async fn status(State(state): State<AppState>) -> Response {
    let counts = match state.ledger.counts_by_status().await {
        Ok(counts) => counts,
        Err(e) => {
            warn!(error = %e, "Failed to read seal counts");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let mut seals: BTreeMap<String, i64> = Status::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for (status, n) in counts {
        seals.insert(status.as_str().to_string(), n);
        metrics::SEALS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(n as f64);
    }

    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        seals,
    })
    .into_response()
}

pub async fn seal(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    let Ok(seal_hash) = hash.parse::<SealHash>() else {
        return error_response(StatusCode::BAD_REQUEST, "seal hash must be 32 bytes of hex");
    };
    match state.ledger.get(&seal_hash).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("seal {} not found", seal_hash)),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub async fn cancel(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    let Ok(seal_hash) = hash.parse::<SealHash>() else {
        return error_response(StatusCode::BAD_REQUEST, "seal hash must be 32 bytes of hex");
    };
    match state.orchestrator.cancel(&seal_hash).await {
        Ok(record) => Json(record).into_response(),
        Err(e @ CancelError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ CancelError::Withdrawn(_)) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/seals/{hash}", get(seal))
        .route("/seals/{hash}/cancel", post(cancel))
        .with_state(state)
}

/// Serve the API until the listener fails.
pub async fn start_api_server(addr: SocketAddr, state: AppState) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
