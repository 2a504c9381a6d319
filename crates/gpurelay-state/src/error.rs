//! Error types for the gpurelay registries.

use thiserror::Error;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors returned synchronously by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already registered: {0}")]
    NodeAlreadyExists(String),

    #[error("node busy: {0} is active and has running work")]
    NodeBusy(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker already registered: {0}")]
    WorkerAlreadyExists(String),

    #[error("worker busy: {0} is already running task {1}")]
    WorkerBusy(String, String),
}
