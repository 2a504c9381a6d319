//! gpurelay-api — REST API for gpurelay.
//!
//! Every response uses the envelope `{success, data?, error?}`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | List nodes |
//! | POST | `/api/v1/nodes` | Register a node |
//! | GET | `/api/v1/nodes/{id}` | Get a node |
//! | DELETE | `/api/v1/nodes/{id}` | Remove a node |
//! | POST | `/api/v1/nodes/{id}/status` | Set a node's status |
//! | POST | `/api/v1/nodes/{id}/activate` | Make a node the active one |
//! | POST | `/api/v1/nodes/{id}/schedule` | Schedule a start and/or stop |
//! | GET | `/api/v1/nodes/active` | The active node |
//! | GET | `/api/v1/nodes/next` | The node that would be picked next |
//! | GET | `/api/v1/stats` | Node, worker and task counters |
//! | GET | `/api/v1/events?limit=N` | Recent node events |
//! | GET | `/api/v1/config` | Scheduling config |
//! | PUT | `/api/v1/config` | Replace the scheduling config |
//! | GET | `/api/v1/workers` | List workers |
//! | POST | `/api/v1/workers` | Register a worker and start polling it |
//! | GET | `/api/v1/workers/{id}` | Get a worker |
//! | DELETE | `/api/v1/workers/{id}` | Remove a worker |
//! | GET | `/api/v1/tasks` | Tasks currently running |
//! | POST | `/api/v1/dispatch` | Run a generation request |

pub mod handlers;
pub mod worker_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use gpurelay_dispatch::TaskDispatcher;
use gpurelay_health::HealthChecker;
use gpurelay_monitor::NodeMonitor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<NodeMonitor>,
    pub health: Arc<HealthChecker>,
    pub dispatcher: Arc<TaskDispatcher>,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes).post(handlers::add_node))
        .route("/nodes/active", get(handlers::active_node))
        .route("/nodes/next", get(handlers::next_node))
        .route("/nodes/{id}", get(handlers::get_node).delete(handlers::remove_node))
        .route("/nodes/{id}/status", post(handlers::update_status))
        .route("/nodes/{id}/activate", post(handlers::activate_node))
        .route("/nodes/{id}/schedule", post(handlers::schedule_node))
        .route("/stats", get(handlers::stats))
        .route("/events", get(handlers::recent_events))
        .route("/config", get(handlers::get_config).put(handlers::put_config))
        .route(
            "/workers",
            get(worker_handlers::list_workers).post(worker_handlers::add_worker),
        )
        .route(
            "/workers/{id}",
            get(worker_handlers::get_worker).delete(worker_handlers::remove_worker),
        )
        .route("/tasks", get(worker_handlers::active_tasks))
        .route("/dispatch", post(worker_handlers::dispatch))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
