//! HTTP ingest using axum
//!
//! Thin inbound collaborator of the publisher:
//! - GET /health - liveness
//! - POST /api/v1/telemetry - accept one reading and publish it
//!
//! A failed publish turns into a 503 so the device can retry instead of the
//! reading being dropped silently.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::broker::{BrokerError, TelemetrySink};
use crate::telemetry::{EventError, TelemetryReading};

/// State shared across handlers
#[derive(Clone)]
pub struct ApiState {
    sink: Arc<dyn TelemetrySink>,
    tracker: TaskTracker,
}

impl ApiState {
    pub fn new(sink: Arc<dyn TelemetrySink>, tracker: TaskTracker) -> Self {
        Self { sink, tracker }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/telemetry", post(ingest))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ingest(
    State(state): State<ApiState>,
    Json(reading): Json<TelemetryReading>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event = reading.into_event(Utc::now());
    event.validate()?;

    let body = json!({
        "status": "queued",
        "device_id": event.device_id(),
        "metric_name": event.metric_name(),
        "timestamp": event.timestamp(),
    });
    debug!("Ingesting {}", event);

    let sink = state.sink.clone();
    state
        .tracker
        .track_future(async move { sink.publish(event).await })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Debug)]
enum ApiError {
    Invalid(String),
    Unavailable(BrokerError),
}

impl From<EventError> for ApiError {
    fn from(e: EventError) -> Self {
        ApiError::Invalid(e.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Serialization(msg) => ApiError::Invalid(msg),
            other => ApiError::Unavailable(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(e) => {
                error!("Telemetry not queued: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
