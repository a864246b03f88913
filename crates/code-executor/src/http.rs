use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json as JsonBody, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::collector::{INTERNAL_ERROR, INVALID_REQUEST, ResponseEnvelope};
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::types::ExecuteRequest;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    executor: Arc<Executor>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            started_at: Utc::now(),
        }
    }
}

/// Routes served on the main port.
pub fn main_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .with_state(state)
}

/// Routes served on the metrics port.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

/// HTTP status for an envelope: code-caused outcomes are 200.
fn http_status(envelope: &ResponseEnvelope) -> StatusCode {
    match envelope.error_kind() {
        Some(INVALID_REQUEST) => StatusCode::BAD_REQUEST,
        Some("ConcurrencyExceeded") => StatusCode::TOO_MANY_REQUESTS,
        Some(INTERNAL_ERROR) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

async fn execute(
    State(state): State<AppState>,
    body: Result<JsonBody<ExecuteRequest>, JsonRejection>,
) -> (StatusCode, Json<ResponseEnvelope>) {
    let envelope = match body {
        Ok(JsonBody(request)) => state.executor.execute(request).await,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "malformed request body");
            state.executor.metrics().record_rejected("invalid");
            ResponseEnvelope::invalid_request(rejection.body_text())
        }
    };
    (http_status(&envelope), Json(envelope))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.executor.pool();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "pool_capacity": pool.capacity(),
        "pool_in_use": pool.in_use(),
    }))
}

async fn scrape(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let resident = sandbox_proc::self_resident_bytes().await;
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render(resident),
    )
}
