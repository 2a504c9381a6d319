use std::time::Duration;

use thiserror::Error;

use gpurelay_health::ClientError;
use gpurelay_state::StateError;

/// Why a dispatch failed. Surfaced to callers as the `error` string of a
/// failed [`TaskResult`](crate::TaskResult).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no available workers")]
    NoAvailableWorkers,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker {worker_id} timed out after {timeout:?}")]
    Timeout { worker_id: String, timeout: Duration },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("worker error: {0}")]
    Worker(#[from] ClientError),

    #[error("worker returned no result (status {0})")]
    NoResult(String),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
