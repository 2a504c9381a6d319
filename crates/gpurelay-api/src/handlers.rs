//! REST API handlers for nodes, stats, events and scheduling config.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use gpurelay_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NodeNotFound(_) | StateError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        StateError::NodeAlreadyExists(_)
        | StateError::WorkerAlreadyExists(_)
        | StateError::NodeBusy(_)
        | StateError::WorkerBusy(..) => StatusCode::CONFLICT,
    };
    error_response(&e.to_string(), status)
}

/// Malformed bodies are a 400, whatever axum's rejection says.
pub(crate) fn bad_body(rejection: JsonRejection) -> Response {
    error_response(&rejection.body_text(), StatusCode::BAD_REQUEST)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.monitor.nodes())
}

/// POST /api/v1/nodes
pub async fn add_node(
    State(state): State<ApiState>,
    body: Result<Json<NodeSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    if spec.id.trim().is_empty() {
        return error_response("node id must not be empty", StatusCode::BAD_REQUEST);
    }
    match state.monitor.add_node(spec) {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.monitor.node(&id) {
        Some(node) => ApiResponse::ok(node).into_response(),
        None => state_error(&StateError::NodeNotFound(id)),
    }
}

/// DELETE /api/v1/nodes/{id}
pub async fn remove_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.monitor.remove_node(&id) {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => state_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: NodeStatus,
    #[serde(default)]
    pub message: String,
}

/// POST /api/v1/nodes/{id}/status
pub async fn update_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.monitor.update_status(&id, req.status, req.message) {
        Ok(event) => ApiResponse::ok(event).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/nodes/{id}/activate
pub async fn activate_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.monitor.set_active(&id) {
        Ok(event) => ApiResponse::ok(event).into_response(),
        Err(e) => state_error(&e),
    }
}

/// Epoch seconds at which to start and/or stop a node.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub start_at: Option<u64>,
    #[serde(default)]
    pub stop_at: Option<u64>,
}

/// POST /api/v1/nodes/{id}/schedule
pub async fn schedule_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    if req.start_at.is_none() && req.stop_at.is_none() {
        return error_response("start_at or stop_at is required", StatusCode::BAD_REQUEST);
    }

    let mut node = None;
    if let Some(at) = req.start_at {
        match state.monitor.schedule_start(&id, at) {
            Ok(n) => node = Some(n),
            Err(e) => return state_error(&e),
        }
    }
    if let Some(at) = req.stop_at {
        match state.monitor.schedule_stop(&id, at) {
            Ok(n) => node = Some(n),
            Err(e) => return state_error(&e),
        }
    }
    ApiResponse::ok(node).into_response()
}

/// GET /api/v1/nodes/active
pub async fn active_node(State(state): State<ApiState>) -> Response {
    match state.monitor.active_node() {
        Some(node) => ApiResponse::ok(node).into_response(),
        None => error_response("no active node", StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/nodes/next
pub async fn next_node(State(state): State<ApiState>) -> Response {
    match state.monitor.next_node() {
        Some(node) => ApiResponse::ok(node).into_response(),
        None => error_response("no selectable node", StatusCode::NOT_FOUND),
    }
}

// ── Stats and events ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatsView {
    pub nodes: NodeStats,
    pub workers: WorkerStats,
    pub completed_tasks: u64,
    pub active_tasks: usize,
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(StatsView {
        nodes: state.monitor.stats(),
        workers: state.health.workers().stats(),
        completed_tasks: state.dispatcher.completed_tasks(),
        active_tasks: state.dispatcher.active_tasks().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    50
}

/// GET /api/v1/events
pub async fn recent_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    ApiResponse::ok(state.monitor.recent_events(query.limit))
}

// ── Config ─────────────────────────────────────────────────────

/// GET /api/v1/config
pub async fn get_config(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.monitor.config())
}

/// PUT /api/v1/config
pub async fn put_config(
    State(state): State<ApiState>,
    body: Result<Json<SchedulingConfig>, JsonRejection>,
) -> Response {
    let Json(config) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    if !(0.0..=1.0).contains(&config.quota_warning_threshold) {
        return error_response(
            &format!(
                "quota_warning_threshold {} is outside [0, 1]",
                config.quota_warning_threshold
            ),
            StatusCode::BAD_REQUEST,
        );
    }
    state.monitor.set_config(config.clone());
    ApiResponse::ok(config).into_response()
}
