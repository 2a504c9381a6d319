//! Task dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpurelay_health::WorkerClient;
use gpurelay_state::*;

use crate::error::{DispatchError, DispatchResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A generation request plus routing hints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(flatten)]
    pub generation: GenerationRequest,
    /// Workers with less free VRAM than this are skipped.
    #[serde(default)]
    pub required_vram_gb: f64,
}

/// Outcome of one dispatch. Also published as the task-completed
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub worker_id: Option<WorkerId>,
    pub success: bool,
    pub status: TaskStatus,
    pub images: Vec<String>,
    pub seed: Option<i64>,
    pub generation_time_seconds: Option<f64>,
    pub error: Option<String>,
}

impl TaskResult {
    fn failed(task_id: &str, kind: TaskKind, worker_id: Option<WorkerId>, error: &DispatchError) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            worker_id,
            success: false,
            status: TaskStatus::Failed,
            images: Vec::new(),
            seed: None,
            generation_time_seconds: None,
            error: Some(error.to_string()),
        }
    }
}

/// Picks workers for generation requests and tracks live tasks.
pub struct TaskDispatcher {
    workers: Arc<WorkerRegistry>,
    client: Arc<dyn WorkerClient>,
    timeout: Duration,
    /// Serializes select-and-claim.
    gate: Mutex<()>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    completed: AtomicU64,
    sequence: AtomicU64,
    events: broadcast::Sender<TaskResult>,
}

impl TaskDispatcher {
    pub fn new(workers: Arc<WorkerRegistry>, client: Arc<dyn WorkerClient>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workers,
            client,
            timeout,
            gate: Mutex::new(()),
            tasks: RwLock::new(HashMap::new()),
            completed: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            events,
        }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Subscribe to task-completed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskResult> {
        self.events.subscribe()
    }

    /// Tasks currently running on a worker, oldest first.
    pub fn active_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
    }

    /// Successful dispatches since this dispatcher was created.
    pub fn completed_tasks(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Run one generation request to completion.
    ///
    /// Never fails: every error comes back as a failed [`TaskResult`].
    /// Cancelling `cancel` abandons the worker call and releases the
    /// worker.
    pub async fn dispatch(&self, request: DispatchRequest, cancel: &CancellationToken) -> TaskResult {
        let task_id = self.next_task_id();

        if let Err(e) = validate(&request.generation) {
            debug!(%task_id, error = %e, "dispatch rejected");
            return TaskResult::failed(&task_id, request.kind, None, &e);
        }

        let worker = match self.claim_worker(&task_id, &request).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(%task_id, required_vram_gb = request.required_vram_gb, error = %e, "dispatch failed");
                return TaskResult::failed(&task_id, request.kind, None, &e);
            }
        };

        let started_at = epoch_secs();
        self.tasks_mut().insert(
            task_id.clone(),
            Task {
                task_id: task_id.clone(),
                worker_id: worker.id.clone(),
                kind: request.kind,
                status: TaskStatus::Processing,
                started_at,
                completed_at: None,
                error: None,
            },
        );
        info!(%task_id, worker_id = %worker.id, kind = ?request.kind, "task dispatched");

        let outcome = self.forward(&worker, &request, cancel).await;

        if let Err(e) = self.workers.release(&worker.id, &task_id) {
            warn!(%task_id, worker_id = %worker.id, error = %e, "failed to release worker");
        }
        self.tasks_mut().remove(&task_id);

        let result = match outcome {
            Ok(output) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    %task_id,
                    worker_id = %worker.id,
                    images = output.images.len(),
                    seconds = output.generation_time_seconds,
                    "task completed"
                );
                TaskResult {
                    task_id,
                    kind: request.kind,
                    worker_id: Some(worker.id),
                    success: true,
                    status: TaskStatus::Completed,
                    images: output.images,
                    seed: Some(output.seed),
                    generation_time_seconds: Some(output.generation_time_seconds),
                    error: None,
                }
            }
            Err(e) => {
                if matches!(e, DispatchError::Worker(_) | DispatchError::Timeout { .. })
                    && let Err(err) = self.workers.record_error(&worker.id, &e.to_string())
                {
                    debug!(worker_id = %worker.id, error = %err, "worker removed before error was recorded");
                }
                warn!(%task_id, worker_id = %worker.id, error = %e, "task failed");
                TaskResult::failed(&task_id, request.kind, Some(worker.id), &e)
            }
        };

        let _ = self.events.send(result.clone());
        result
    }

    async fn claim_worker(&self, task_id: &str, request: &DispatchRequest) -> DispatchResult<Worker> {
        let _gate = self.gate.lock().await;
        let workers = self.workers.list();
        let chosen = select_worker(
            &workers,
            request.generation.model_id.as_deref(),
            request.required_vram_gb,
        )
        .ok_or(DispatchError::NoAvailableWorkers)?;
        Ok(self.workers.claim(&chosen.id, task_id)?)
    }

    async fn forward(
        &self,
        worker: &Worker,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> DispatchResult<GenerationOutput> {
        let call = tokio::time::timeout(
            self.timeout,
            self.client.generate(&worker.address, &request.generation),
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            response = call => response.map_err(|_| DispatchError::Timeout {
                worker_id: worker.id.clone(),
                timeout: self.timeout,
            })??,
        };

        response.result.ok_or(DispatchError::NoResult(response.status))
    }

    fn next_task_id(&self) -> TaskId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("task-{}-{seq}", epoch_secs())
    }

    fn tasks_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Idle workers with at least `required_vram_gb` free. A worker that has
/// `model_id` loaded wins; otherwise the one with the most free VRAM.
fn select_worker<'a>(
    workers: &'a [Worker],
    model_id: Option<&str>,
    required_vram_gb: f64,
) -> Option<&'a Worker> {
    if let Some(model) = model_id
        && let Some(warm) = eligible(workers, required_vram_gb)
            .filter(|w| w.current_model.as_deref() == Some(model))
            .max_by(most_free)
    {
        return Some(warm);
    }
    eligible(workers, required_vram_gb).max_by(most_free)
}

fn eligible(workers: &[Worker], required_vram_gb: f64) -> impl Iterator<Item = &Worker> {
    workers
        .iter()
        .filter(move |w| w.is_idle() && w.free_vram_gb >= required_vram_gb)
}

/// Ties go to the lower id.
fn most_free(a: &&Worker, b: &&Worker) -> std::cmp::Ordering {
    a.free_vram_gb
        .total_cmp(&b.free_vram_gb)
        .then_with(|| b.id.cmp(&a.id))
}

fn validate(request: &GenerationRequest) -> DispatchResult<()> {
    if request.prompt.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("prompt is empty".to_string()));
    }
    if request.width == 0 || request.height == 0 {
        return Err(DispatchError::InvalidRequest(format!(
            "image size {}x{} is empty",
            request.width, request.height
        )));
    }
    if request.steps == 0 {
        return Err(DispatchError::InvalidRequest("steps must be positive".to_string()));
    }
    if request.batch_size == 0 {
        return Err(DispatchError::InvalidRequest("batch size must be positive".to_string()));
    }
    Ok(())
}
