//! HTTP surface: the prediction endpoint plus health and liveness probes.
//!
//! Failure mapping: validation faults are 400 and never touch the
//! predictor, a not-ready serving version is 503 (caller should retry with
//! backoff), a timed-out prediction is 504, and internal predictor
//! failures are 500 with diagnostic detail kept in the log only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, warn};

use serving_core::error::ValidationError;
use serving_core::loader::{LoadStatus, ModelCache};
use serving_core::resolver::ModelVersion;

pub struct AppState {
    pub cache: Arc<ModelCache>,
    /// The designated serving version for the life of the process.
    pub serving: Option<ModelVersion>,
    pub request_timeout: Duration,
    pub limiter: Arc<Semaphore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/live", get(live))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub label: String,
    pub confidence: f64,
    pub scores: BTreeMap<String, f64>,
    pub model_version: String,
}

enum ApiError {
    BadBody(String),
    Validation(ValidationError),
    NotReady(LoadStatus),
    Timeout,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            ApiError::BadBody(detail) => (StatusCode::BAD_REQUEST, "validation_error", detail),
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
            ApiError::NotReady(s) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_ready",
                format!("model is not ready (status: {s}), retry later"),
            ),
            ApiError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "prediction_timeout",
                "prediction timed out".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "prediction_error",
                "prediction failed".to_string(),
            ),
        };
        (status, Json(json!({ "error": code, "detail": detail }))).into_response()
    }
}

async fn predict(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    // Malformed bodies are rejected before any model work happens.
    let Json(body) = body.map_err(|e| ApiError::BadBody(e.body_text()))?;

    let Some(version) = state.serving.clone() else {
        return Err(ApiError::NotReady(LoadStatus::Unconfigured));
    };
    let Some(lease) = state.cache.try_lease(&version) else {
        // Kick a background load if nothing holds the slot; the caller
        // retries later rather than blocking on the fetch.
        state.cache.ensure_loading(&version);
        return Err(ApiError::NotReady(state.cache.status(Some(&version))));
    };

    let features = lease
        .input_schema()
        .validate(&body)
        .map_err(ApiError::Validation)?;

    let started = Instant::now();
    let permit =
        tokio::time::timeout(state.request_timeout, Arc::clone(&state.limiter).acquire_owned())
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(|_| ApiError::Internal)?;

    // The lease rides into the blocking task, pinning the cache entry until
    // the prediction finishes even if this request is abandoned on timeout.
    let remaining = state.request_timeout.saturating_sub(started.elapsed());
    let version_id = version.id.clone();
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        lease.predict(&features)
    });
    let joined = tokio::time::timeout(remaining, task).await.map_err(|_| {
        warn!(version = %version_id, "prediction timed out, request abandoned");
        ApiError::Timeout
    })?;
    let result = joined.map_err(|e| {
        error!(version = %version_id, error = ?e, "prediction task failed to join");
        ApiError::Internal
    })?;
    let prediction = result.map_err(|e| {
        // Diagnostic detail stays in the log; the client sees a generic 500.
        error!(version = %version_id, error = %e, "predictor failure");
        ApiError::Internal
    })?;

    Ok(Json(PredictResponse {
        label: prediction.label,
        confidence: prediction.confidence,
        scores: prediction.scores,
        model_version: version_id,
    }))
}

/// Readiness, derived solely from loader state. Orchestration can gate on
/// the status code; the body carries the status string and version.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let status = state.cache.status(state.serving.as_ref());
    let code = if status == LoadStatus::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": status,
        "model_version": state.serving.as_ref().map(|v| v.id.clone()),
    });
    (code, Json(body)).into_response()
}

async fn live() -> Json<Value> {
    Json(json!({ "live": true }))
}
