//! HTTP surface of the daemon.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/records` | Push a batch of data records |
//! | POST | `/v1/events` | Push a batch of event records |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | KV reachability |

use std::sync::Arc;

use alarm_kv::{KvClient, SharedKv};
use alarm_metrics::PipelineMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tracing::{debug, warn};

use crate::workers::{Dispatcher, JobKind};

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Dispatcher,
    pub kv: SharedKv,
    pub metrics: Arc<PipelineMetrics>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/v1/records", post(push_records))
        .route("/v1/events", post(push_events))
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

async fn push(state: &HttpState, kind: JobKind, body: Value) -> axum::response::Response {
    let Value::Array(batch) = body else {
        return error_response("body must be a JSON array", StatusCode::BAD_REQUEST).into_response();
    };
    let report = state.dispatcher.dispatch(kind, batch).await;
    if report.rejected > 0 {
        warn!(kind = ?kind, rejected = report.rejected, "pushed records rejected");
    }
    debug!(kind = ?kind, accepted = report.accepted, "pushed batch queued");
    (StatusCode::ACCEPTED, Json(report)).into_response()
}

/// POST /v1/records
pub async fn push_records(State(state): State<HttpState>, Json(body): Json<Value>) -> impl IntoResponse {
    push(&state, JobKind::Points, body).await
}

/// POST /v1/events
pub async fn push_events(State(state): State<HttpState>, Json(body): Json<Value>) -> impl IntoResponse {
    push(&state, JobKind::Events, body).await
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    let body = alarm_metrics::render_prometheus(&state.metrics.snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /healthz
pub async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    match state.kv.ping().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
