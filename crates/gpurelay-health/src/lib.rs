//! gpurelay-health — worker health polling and the worker HTTP client.
//!
//! Each registered worker gets its own poll loop. A successful status
//! poll refreshes capacity and marks the worker online; any failure marks
//! it offline and keeps the error. Only transitions are published, so a
//! worker that stays up (or down) is silent.

pub mod checker;
pub mod client;
pub mod error;

pub use checker::{HealthChecker, HealthConfig, WorkerStatusChanged};
pub use client::{BoxFuture, HttpWorkerClient, WorkerClient, check_address};
pub use error::{ClientError, ClientResult};
