//! HTTP producer surface.
//!
//! - `GET  /health`         broker ping, 200 / 503
//! - `GET  /worker/status`  queues, connectivity, shutdown state, counts
//! - `POST /worker/ping`    enqueue a `worker:ping` task
//! - `POST /tasks`          enqueue any registered task type
//!
//! Every response carries `X-Request-ID`; the same id becomes the task's
//! correlation id so API and worker log lines can be joined.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Extension, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use courier_core::app::{Connectivity, EnqueueClient, EnqueueOptions, ShutdownCoordinator, ShutdownState};
use courier_core::domain::{CorrelationId, CourierError, QUEUE_DEFAULT};
use courier_core::ports::QueueCounts;
use courier_core::typed::Task;
use courier_core::DispatchPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::tasks::PingTask;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_BODY_BYTES: usize = 1 << 20;
const DEFAULT_PING_MESSAGE: &str = "ping from API";
const PING_MAX_RETRIES: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpState {
    pub client: EnqueueClient,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub dispatch_policy: DispatchPolicy,
}

/// Request id resolved by the middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub CorrelationId);

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/worker/status", get(worker_status))
        .route("/worker/ping", post(worker_ping))
        .route("/tasks", post(submit_task))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(CorrelationId::new)
        .unwrap_or_else(CorrelationId::generate);
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Error body shared by every route.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<CourierError> for ApiError {
    fn from(err: CourierError) -> Self {
        let status = match &err {
            CourierError::InvalidOptions(_)
            | CourierError::UnknownQueue(_)
            | CourierError::UnknownTaskType(_) => StatusCode::BAD_REQUEST,
            CourierError::QueueUnavailable(_) | CourierError::BrokerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: BTreeMap<&'static str, &'static str>,
    checked: DateTime<Utc>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health(State(state): State<HttpState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let connectivity = state.client.ping().await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (code, broker, error) = match connectivity {
        Connectivity::Up => (StatusCode::OK, "up", None),
        Connectivity::Down(reason) => {
            warn!(error = %reason, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "down", Some(reason))
        }
    };
    let body = HealthResponse {
        status: BTreeMap::from([("broker", broker)]),
        checked: Utc::now(),
        duration_ms,
        error,
    };
    (code, Json(body))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    queues: Vec<String>,
    connectivity: Connectivity,
    dispatch_policy: String,
    state: ShutdownState,
    in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<BTreeMap<String, QueueCounts>>,
}

async fn worker_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    let status = state.client.query_status().await;
    let counts = if status.connectivity.is_up() {
        state.client.queue_counts().await.ok()
    } else {
        None
    };
    Json(StatusResponse {
        queues: status.queue_names,
        connectivity: status.connectivity,
        dispatch_policy: state.dispatch_policy.to_string(),
        state: state.coordinator.state(),
        in_flight: state.coordinator.in_flight_count(),
        counts,
    })
}

#[derive(Debug, Default, Deserialize)]
struct PingRequest {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PingResponse {
    success: bool,
    task_id: String,
    task_type: &'static str,
    queued_at: DateTime<Utc>,
    message: String,
}

/// The body is optional; an empty body sends the default message.
async fn worker_ping(
    State(state): State<HttpState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<(StatusCode, Json<PingResponse>), ApiError> {
    let request: PingRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PingRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };
    let message = request
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PING_MESSAGE.to_string());

    let task = PingTask {
        message: message.clone(),
        request_id: request_id.to_string(),
        queued_at: Utc::now(),
    };
    let options = EnqueueOptions::new()
        .queue(QUEUE_DEFAULT)
        .max_retries(PING_MAX_RETRIES)
        .timeout(PING_TIMEOUT);

    let receipt = state
        .client
        .submit_typed(&task, options, Some(request_id))
        .await
        .inspect_err(|err| error!(error = %err, "failed to enqueue ping task"))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PingResponse {
            success: true,
            task_id: receipt.task_id.to_string(),
            task_type: PingTask::TYPE,
            queued_at: task.queued_at,
            message,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: Value,
    queue: Option<String>,
    max_retries: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    success: bool,
    task_id: String,
    task_type: String,
    queue: String,
    correlation_id: String,
    queued_at: DateTime<Utc>,
}

async fn submit_task(
    State(state): State<HttpState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let request: SubmitTaskRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|e| ApiError::bad_request(format!("invalid payload: {e}")))?;
    let options = EnqueueOptions {
        queue: request.queue,
        max_retries: request.max_retries,
        timeout: request.timeout_ms.map(Duration::from_millis),
    };

    let receipt = state
        .client
        .enqueue(request.task_type.as_str(), payload, options, Some(request_id))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitTaskResponse {
            success: true,
            task_id: receipt.task_id.to_string(),
            task_type: receipt.task_type.to_string(),
            queue: receipt.queue,
            correlation_id: receipt.correlation_id.to_string(),
            queued_at: receipt.enqueued_at,
        }),
    ))
}
