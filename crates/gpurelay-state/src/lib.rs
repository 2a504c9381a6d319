//! gpurelay-state — in-memory state for the gpurelay coordinator.
//!
//! Holds the two authoritative registries and the diagnostic event log:
//!
//! - [`NodeRegistry`]: upstream compute accounts/sessions, their status,
//!   quota and session counters, and which one is active.
//! - [`WorkerRegistry`]: generation backends and their live capacity.
//! - [`EventLog`]: bounded FIFO of node lifecycle events.
//!
//! # Concurrency
//!
//! Both registries guard a plain `HashMap` with a `std::sync::RwLock` and
//! hand out cloned snapshots. Lock hold time is a single map operation;
//! callers iterate snapshots, never the live map, so slow per-item work
//! (logging, event fan-out) never runs under the lock.

pub mod error;
pub mod events;
pub mod nodes;
pub mod types;
pub mod workers;

pub use error::{StateError, StateResult};
pub use events::EventLog;
pub use nodes::NodeRegistry;
pub use types::*;
pub use workers::{Transition, WorkerRegistry};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
