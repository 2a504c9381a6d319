//! Health checker — one poll loop per worker.
//!
//! A poll that succeeds marks the worker online (busy if it holds a task)
//! and refreshes its capacity. A failed or timed-out poll marks it
//! offline and records the error; workers are never removed here. A
//! cancelled poll changes nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpurelay_state::*;

use crate::client::WorkerClient;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll cadence and per-poll timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Published when a poll changes a worker's status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatusChanged {
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub from: WorkerStatus,
    pub to: WorkerStatus,
    pub error: Option<String>,
    pub timestamp: u64,
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Runs and tracks the per-worker poll loops.
pub struct HealthChecker {
    workers: Arc<WorkerRegistry>,
    client: Arc<dyn WorkerClient>,
    config: HealthConfig,
    events: broadcast::Sender<WorkerStatusChanged>,
    /// Active loops: worker_id → slot.
    monitors: RwLock<HashMap<WorkerId, MonitorSlot>>,
}

impl HealthChecker {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        client: Arc<dyn WorkerClient>,
        config: HealthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workers,
            client,
            config,
            events,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerStatusChanged> {
        self.events.subscribe()
    }

    /// Start polling a worker, replacing any loop already running for it.
    ///
    /// The first poll happens immediately.
    pub async fn start_monitor(self: &Arc<Self>, worker_id: &str) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_poll_loop(worker_id.to_string(), cancel.clone()));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(worker_id.to_string(), MonitorSlot { handle, cancel }) {
            old.cancel.cancel();
            old.handle.abort();
        }

        info!(%worker_id, interval = ?self.config.poll_interval, "health monitor started");
    }

    pub async fn stop_monitor(&self, worker_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(worker_id) {
            slot.cancel.cancel();
            slot.handle.abort();
            info!(%worker_id, "health monitor stopped");
        }
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            slot.cancel.cancel();
            slot.handle.abort();
            debug!(worker_id = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.monitors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_monitoring(&self, worker_id: &str) -> bool {
        self.monitors.read().await.contains_key(worker_id)
    }

    /// Poll a worker once and apply the outcome.
    ///
    /// Returns `None` when the poll was cancelled or the worker is no
    /// longer registered.
    pub async fn check_once(&self, worker_id: &str, cancel: &CancellationToken) -> Option<Transition> {
        let worker = self.workers.get(worker_id)?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%worker_id, "status poll cancelled");
                return None;
            }
            outcome = tokio::time::timeout(self.config.probe_timeout, self.client.status(&worker.address)) => outcome,
        };

        let now = epoch_secs();
        let (applied, error) = match outcome {
            Ok(Ok(report)) => (self.workers.record_probe_success(worker_id, &report, now), None),
            Ok(Err(e)) => {
                let error = e.to_string();
                (self.workers.record_probe_failure(worker_id, &error), Some(error))
            }
            Err(_) => {
                let error = format!("status poll timed out after {:?}", self.config.probe_timeout);
                (self.workers.record_probe_failure(worker_id, &error), Some(error))
            }
        };

        let transition = match applied {
            Ok(t) => t,
            Err(e) => {
                debug!(%worker_id, error = %e, "worker removed during poll");
                return None;
            }
        };

        if transition.changed() {
            match &error {
                Some(error) => warn!(%worker_id, from = ?transition.from, to = ?transition.to, %error, "worker status changed"),
                None => info!(%worker_id, from = ?transition.from, to = ?transition.to, "worker status changed"),
            }
            let _ = self.events.send(WorkerStatusChanged {
                worker_id: worker.id,
                worker_name: worker.name,
                from: transition.from,
                to: transition.to,
                error,
                timestamp: now,
            });
        } else {
            debug!(%worker_id, status = ?transition.to, "status poll");
        }

        Some(transition)
    }

    async fn run_poll_loop(self: Arc<Self>, worker_id: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.workers.get(&worker_id).is_none() {
                        debug!(%worker_id, "worker gone, poll loop exiting");
                        break;
                    }
                    self.check_once(&worker_id, &cancel).await;
                }
                _ = cancel.cancelled() => {
                    debug!(%worker_id, "poll loop shutting down");
                    break;
                }
            }
        }
    }
}
