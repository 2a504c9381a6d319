//! Worker registry — generation workers and their live capacity.
//!
//! Health polls write capacity and connectivity here; the dispatcher
//! claims and releases workers. A worker is busy iff `current_task` is set.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::types::*;

/// A status change caused by a registry write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, worker: Worker) -> StateResult<()> {
        let mut workers = self.write();
        if workers.contains_key(&worker.id) {
            return Err(StateError::WorkerAlreadyExists(worker.id));
        }
        info!(worker_id = %worker.id, address = %worker.address, "worker registered");
        workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Remove a worker. A worker with a task in flight cannot be removed.
    pub fn remove_worker(&self, id: &str) -> StateResult<Worker> {
        let mut workers = self.write();
        let worker = workers
            .get(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;
        if let Some(task) = &worker.current_task {
            return Err(StateError::WorkerBusy(id.to_string(), task.clone()));
        }
        let worker = workers
            .remove(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;
        info!(worker_id = %id, "worker removed");
        Ok(worker)
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every worker, ordered by id.
    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.read().values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a successful status poll: refresh capacity and mark online.
    pub fn record_probe_success(
        &self,
        id: &str,
        report: &WorkerStatusReport,
        now: u64,
    ) -> StateResult<Transition> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;

        let from = worker.status;
        worker.status = if worker.current_task.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Online
        };
        worker.gpu_name = Some(report.gpu_name.clone());
        worker.total_vram_gb = report.total_vram_gb;
        worker.free_vram_gb = report.free_vram_gb;
        worker.current_model = report.current_model.clone();
        worker.last_seen = Some(now);
        worker.last_error = None;

        Ok(Transition {
            from,
            to: worker.status,
        })
    }

    /// Record a failed status poll: mark offline and keep the error.
    pub fn record_probe_failure(&self, id: &str, error: &str) -> StateResult<Transition> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;

        let from = worker.status;
        worker.status = WorkerStatus::Offline;
        worker.last_error = Some(error.to_string());

        Ok(Transition {
            from,
            to: WorkerStatus::Offline,
        })
    }

    /// Mark a worker busy with `task_id`.
    pub fn claim(&self, id: &str, task_id: &str) -> StateResult<Worker> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;
        if let Some(current) = &worker.current_task {
            return Err(StateError::WorkerBusy(id.to_string(), current.clone()));
        }
        worker.current_task = Some(task_id.to_string());
        worker.status = WorkerStatus::Busy;
        debug!(worker_id = %id, %task_id, "worker claimed");
        Ok(worker.clone())
    }

    /// Clear the busy claim held by `task_id`.
    ///
    /// A worker that went offline while busy stays offline.
    pub fn release(&self, id: &str, task_id: &str) -> StateResult<()> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;
        if worker.current_task.as_deref() == Some(task_id) {
            worker.current_task = None;
            if worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Online;
            }
            debug!(worker_id = %id, %task_id, "worker released");
        }
        Ok(())
    }

    /// Record an error against a worker without changing its status.
    pub fn record_error(&self, id: &str, error: &str) -> StateResult<()> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StateError::WorkerNotFound(id.to_string()))?;
        worker.last_error = Some(error.to_string());
        Ok(())
    }

    pub fn stats(&self) -> WorkerStats {
        let workers = self.read();
        let mut stats = WorkerStats {
            total: workers.len(),
            ..WorkerStats::default()
        };
        for worker in workers.values() {
            match worker.status {
                WorkerStatus::Online => stats.online += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Offline => stats.offline += 1,
                WorkerStatus::Connecting => stats.connecting += 1,
            }
            if worker.status != WorkerStatus::Offline {
                stats.total_vram_gb += worker.total_vram_gb;
                stats.free_vram_gb += worker.free_vram_gb;
            }
        }
        stats
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkerId, Worker>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkerId, Worker>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> Worker {
        Worker::from_spec(
            WorkerSpec {
                id: id.to_string(),
                name: format!("worker {id}"),
                address: "127.0.0.1:7860".to_string(),
            },
            1000,
        )
    }

    fn report(free: f64) -> WorkerStatusReport {
        WorkerStatusReport {
            gpu_name: "RTX 3090".to_string(),
            total_vram_gb: 24.0,
            free_vram_gb: free,
            current_model: Some("sdxl".to_string()),
        }
    }

    #[test]
    fn new_worker_is_connecting() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        assert_eq!(reg.get("w1").unwrap().status, WorkerStatus::Connecting);
    }

    #[test]
    fn duplicate_worker_rejected() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        assert!(matches!(
            reg.add_worker(worker("w1")),
            Err(StateError::WorkerAlreadyExists(_))
        ));
    }

    #[test]
    fn probe_success_refreshes_capacity() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();

        let t = reg.record_probe_success("w1", &report(18.0), 2000).unwrap();
        assert_eq!(t.from, WorkerStatus::Connecting);
        assert_eq!(t.to, WorkerStatus::Online);

        let w = reg.get("w1").unwrap();
        assert_eq!(w.free_vram_gb, 18.0);
        assert_eq!(w.current_model.as_deref(), Some("sdxl"));
        assert_eq!(w.last_seen, Some(2000));
    }

    #[test]
    fn probe_failure_marks_offline_but_keeps_worker() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        reg.record_probe_success("w1", &report(18.0), 2000).unwrap();

        let t = reg.record_probe_failure("w1", "connection refused").unwrap();
        assert!(t.changed());
        let again = reg.record_probe_failure("w1", "connection refused").unwrap();
        assert!(!again.changed());

        let w = reg.get("w1").unwrap();
        assert_eq!(w.status, WorkerStatus::Offline);
        assert_eq!(w.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn claim_and_release_cycle() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        reg.record_probe_success("w1", &report(18.0), 2000).unwrap();

        reg.claim("w1", "task-1").unwrap();
        assert_eq!(reg.get("w1").unwrap().status, WorkerStatus::Busy);
        assert!(matches!(
            reg.claim("w1", "task-2"),
            Err(StateError::WorkerBusy(_, _))
        ));

        // Releasing with the wrong task id is a no-op.
        reg.release("w1", "task-2").unwrap();
        assert!(reg.get("w1").unwrap().current_task.is_some());

        reg.release("w1", "task-1").unwrap();
        let w = reg.get("w1").unwrap();
        assert!(w.is_idle());
    }

    #[test]
    fn busy_worker_stays_busy_on_probe_success() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        reg.record_probe_success("w1", &report(18.0), 2000).unwrap();
        reg.claim("w1", "task-1").unwrap();

        let t = reg.record_probe_success("w1", &report(4.0), 2010).unwrap();
        assert_eq!(t.to, WorkerStatus::Busy);
        assert!(!t.changed());
    }

    #[test]
    fn release_keeps_offline_worker_offline() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        reg.record_probe_success("w1", &report(18.0), 2000).unwrap();
        reg.claim("w1", "task-1").unwrap();
        reg.record_probe_failure("w1", "timeout").unwrap();

        reg.release("w1", "task-1").unwrap();
        let w = reg.get("w1").unwrap();
        assert_eq!(w.status, WorkerStatus::Offline);
        assert!(w.current_task.is_none());
    }

    #[test]
    fn remove_refuses_busy_worker() {
        let reg = WorkerRegistry::new();
        reg.add_worker(worker("w1")).unwrap();
        reg.record_probe_success("w1", &report(18.0), 2000).unwrap();
        reg.claim("w1", "task-1").unwrap();

        assert!(matches!(reg.remove_worker("w1"), Err(StateError::WorkerBusy(_, _))));
        reg.release("w1", "task-1").unwrap();
        assert!(reg.remove_worker("w1").is_ok());
        assert!(reg.is_empty());
    }

    #[test]
    fn stats_count_by_status() {
        let reg = WorkerRegistry::new();
        for id in ["w1", "w2", "w3"] {
            reg.add_worker(worker(id)).unwrap();
        }
        reg.record_probe_success("w1", &report(20.0), 2000).unwrap();
        reg.record_probe_success("w2", &report(10.0), 2000).unwrap();
        reg.claim("w2", "task-1").unwrap();

        let stats = reg.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.connecting, 1);
        assert_eq!(stats.free_vram_gb, 30.0);
    }
}
