//! gpurelay-dispatch — routes generation requests to workers.
//!
//! One dispatch picks an idle worker with enough free VRAM (preferring
//! one that already has the requested model loaded), claims it, forwards
//! the request and releases it again. Picking and claiming happen under
//! a single gate so two concurrent dispatches never claim the same
//! worker; the network call runs outside it.
//!
//! Nothing is queued or retried. With no eligible worker the dispatch
//! fails at once with `no available workers`.

pub mod dispatcher;
pub mod error;

pub use dispatcher::{DispatchRequest, TaskDispatcher, TaskResult};
pub use error::{DispatchError, DispatchResult};
