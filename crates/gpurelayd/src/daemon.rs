//! Subsystem assembly and background tasks.

use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use gpurelay_api::{ApiState, build_router};
use gpurelay_dispatch::{TaskDispatcher, TaskResult};
use gpurelay_health::{HealthChecker, HttpWorkerClient, WorkerClient, WorkerStatusChanged};
use gpurelay_monitor::{MonitorEvent, NodeMonitor};
use gpurelay_state::*;

use crate::config::DaemonConfig;

/// The wired-up coordinator: monitor, health checker and dispatcher over
/// shared registries.
pub struct Daemon {
    pub monitor: Arc<NodeMonitor>,
    pub health: Arc<HealthChecker>,
    pub dispatcher: Arc<TaskDispatcher>,
}

impl Daemon {
    /// Build from config, talking to workers over HTTP.
    pub fn build(config: &DaemonConfig) -> anyhow::Result<Self> {
        Self::with_client(config, Arc::new(HttpWorkerClient::new()))
    }

    /// Build from config with a custom worker client.
    ///
    /// Seeds the registries from `[[nodes]]` and `[[workers]]`. Nothing
    /// runs until [`start`](Self::start).
    pub fn with_client(config: &DaemonConfig, client: Arc<dyn WorkerClient>) -> anyhow::Result<Self> {
        config.validate()?;
        let now = epoch_secs();

        let events = Arc::new(EventLog::with_capacity(config.monitor.event_log_capacity));
        let nodes = Arc::new(NodeRegistry::new(events));
        for spec in &config.nodes {
            nodes.add_node(Node::from_spec(spec.clone(), now))?;
        }
        let monitor = Arc::new(NodeMonitor::new(nodes, config.scheduling()?, config.ticks()?));

        let workers = Arc::new(WorkerRegistry::new());
        for spec in &config.workers {
            workers.add_worker(Worker::from_spec(spec.clone(), now))?;
        }
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&workers),
            Arc::clone(&client),
            config.health()?,
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(workers, client, config.dispatch_timeout()?));

        info!(
            nodes = config.nodes.len(),
            workers = config.workers.len(),
            "registries seeded"
        );
        Ok(Self {
            monitor,
            health,
            dispatcher,
        })
    }

    pub fn router(&self) -> Router {
        build_router(ApiState {
            monitor: Arc::clone(&self.monitor),
            health: Arc::clone(&self.health),
            dispatcher: Arc::clone(&self.dispatcher),
        })
    }

    /// Start the monitor ticks, one poll loop per registered worker, and
    /// the event logger. All stop when `shutdown` flips to `true`, except
    /// the poll loops, which [`HealthChecker::stop_all`] ends.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self.monitor.spawn(shutdown.clone()).into();

        for worker in self.health.workers().list() {
            self.health.start_monitor(&worker.id).await;
        }

        handles.push(tokio::spawn(log_events(
            self.monitor.subscribe(),
            self.health.subscribe(),
            self.dispatcher.subscribe(),
            shutdown,
        )));
        handles
    }
}

/// Log every notification the subsystems publish.
async fn log_events(
    mut monitor: broadcast::Receiver<MonitorEvent>,
    mut health: broadcast::Receiver<WorkerStatusChanged>,
    mut tasks: broadcast::Receiver<TaskResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = monitor.recv() => match event {
                Ok(MonitorEvent::StatsUpdated(_)) => {}
                Ok(MonitorEvent::SwitchRequired(notice)) => info!(
                    from = %notice.current.id,
                    to = %notice.next.id,
                    reason = %notice.reason,
                    emergency = notice.emergency,
                    "switch required"
                ),
                Ok(event) => info!(event = event.name(), "monitor event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event logger lagged on monitor events"),
                Err(RecvError::Closed) => break,
            },
            event = health.recv() => match event {
                Ok(change) => info!(
                    worker_id = %change.worker_id,
                    from = ?change.from,
                    to = ?change.to,
                    "worker status changed"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event logger lagged on worker events"),
                Err(RecvError::Closed) => break,
            },
            event = tasks.recv() => match event {
                Ok(result) => info!(
                    task_id = %result.task_id,
                    worker_id = ?result.worker_id,
                    success = result.success,
                    "task completed"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event logger lagged on task events"),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
