//! REST API handlers for workers, live tasks and dispatch.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::error;

use gpurelay_dispatch::DispatchRequest;
use gpurelay_health::check_address;
use gpurelay_state::*;

use crate::ApiState;
use crate::handlers::{ApiResponse, bad_body, error_response, state_error};

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.health.workers().list())
}

/// POST /api/v1/workers
///
/// Polling starts right away; the worker stays `connecting` until the
/// first poll answers.
pub async fn add_worker(
    State(state): State<ApiState>,
    body: Result<Json<WorkerSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    if spec.id.trim().is_empty() || spec.address.trim().is_empty() {
        return error_response("worker id and address are required", StatusCode::BAD_REQUEST);
    }
    if let Err(e) = check_address(&spec.address) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }

    let worker = Worker::from_spec(spec, epoch_secs());
    if let Err(e) = state.health.workers().add_worker(worker.clone()) {
        return state_error(&e);
    }
    state.health.start_monitor(&worker.id).await;
    (StatusCode::CREATED, ApiResponse::ok(worker)).into_response()
}

/// GET /api/v1/workers/{id}
pub async fn get_worker(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.health.workers().get(&id) {
        Some(worker) => ApiResponse::ok(worker).into_response(),
        None => state_error(&StateError::WorkerNotFound(id)),
    }
}

/// DELETE /api/v1/workers/{id}
pub async fn remove_worker(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.health.workers().remove_worker(&id) {
        Ok(worker) => {
            state.health.stop_monitor(&id).await;
            ApiResponse::ok(worker).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/tasks
pub async fn active_tasks(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.dispatcher.active_tasks())
}

/// POST /api/v1/dispatch
///
/// Always answers with the task result, failed or not. The dispatch
/// runs on its own task so a client that disconnects cancels it cleanly
/// instead of leaving the worker claimed.
pub async fn dispatch(
    State(state): State<ApiState>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    let cancel = CancellationToken::new();
    // Cancels the dispatch if this handler is dropped mid-flight.
    let _guard = cancel.clone().drop_guard();
    let dispatcher = Arc::clone(&state.dispatcher);
    let handle = tokio::spawn(async move { dispatcher.dispatch(request, &cancel).await });

    match handle.await {
        Ok(result) => ApiResponse::ok(result).into_response(),
        Err(e) => {
            error!(error = %e, "dispatch task failed");
            error_response("dispatch task failed", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
