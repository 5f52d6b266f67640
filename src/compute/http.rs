//! HTTP prediction server.
//!
//! Routes:
//! - `POST /invocations`: split-oriented JSON payload in, `{"predictions": [...]}` out
//! - `GET /health`: [`HealthResponse`] for the served deployment key
//! - `GET /metrics`: Prometheus exposition, when a recorder is installed

use crate::error::{ChurnlineError, Result};
use crate::health::{ComponentHealth, HealthResponse};
use crate::observability::record_inference_request;
use crate::pipeline::InferenceFlow;
use crate::types::DeploymentKey;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state of the prediction server.
#[derive(Clone)]
pub struct ServerState {
    flow: InferenceFlow,
    key: DeploymentKey,
    metrics: Option<PrometheusHandle>,
    started: Instant,
}

impl ServerState {
    pub fn new(flow: InferenceFlow, key: DeploymentKey) -> Self {
        Self {
            flow,
            key,
            metrics: None,
            started: Instant::now(),
        }
    }

    /// Serves `/metrics` from this recorder handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Serialize)]
struct PredictionResponse {
    predictions: Vec<f64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: &ChurnlineError) -> Response {
    let status =
        StatusCode::from_u16(e.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

/// Builds the router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/invocations", post(handle_invocations))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Run the prediction server until the listener fails.
pub async fn run_prediction_server(state: ServerState, addr: SocketAddr) -> Result<()> {
    let key = state.key.clone();
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, key = %key, "Prediction server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ChurnlineError::Internal(e.to_string()))?;

    Ok(())
}

// Handlers

async fn handle_invocations(State(state): State<ServerState>, body: String) -> Response {
    match state.flow.predict(&body, &state.key).await {
        Ok(predictions) => {
            record_inference_request(predictions.len(), 200);
            Json(PredictionResponse { predictions }).into_response()
        }
        Err(e) => {
            let status = e.to_status_code();
            record_inference_request(0, status);
            warn!(status, error = %e, "Inference request failed");
            error_response(&e)
        }
    }
}

async fn handle_health(State(state): State<ServerState>) -> Response {
    let component = match state.flow.registry().find(&state.key, false).await {
        Some(record) => record
            .endpoint
            .health()
            .await
            .with_detail("version", record.version.to_string()),
        None => ComponentHealth::unhealthy(state.key.to_string(), "not deployed"),
    };

    let response = HealthResponse::new(env!("CARGO_PKG_VERSION"), state.started)
        .with_components(vec![component]);
    let status = StatusCode::from_u16(response.status.to_status_code())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(response)).into_response()
}

async fn handle_metrics(State(state): State<ServerState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
