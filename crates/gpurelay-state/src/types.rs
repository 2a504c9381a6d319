//! Domain types for the gpurelay coordinator.
//!
//! Nodes are upstream compute accounts/sessions with daily quota and a
//! per-session time limit. Workers are generation backends that run one
//! task at a time. All timestamps are Unix epoch seconds and all quota and
//! session durations are whole seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a compute node.
pub type NodeId = String;

/// Unique identifier for a generation worker.
pub type WorkerId = String;

/// Unique identifier for a dispatched task.
pub type TaskId = String;

/// Length of a quota day.
pub const DAY_SECS: u64 = 24 * 60 * 60;

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle status of a compute node.
///
/// Transitions are not validated: any status is reachable from any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Queued,
    Warming,
    Ready,
    Starting,
    Running,
    Rebooting,
    Error,
    Disconnected,
    QuotaExceeded,
    Emergency,
}

impl NodeStatus {
    /// Whether the node is in a failed state that warrants switching away.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            NodeStatus::Error | NodeStatus::Disconnected | NodeStatus::QuotaExceeded
        )
    }
}

/// Registration payload for a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: String,
    /// Provider tag (e.g. "kaggle", "colab").
    #[serde(default)]
    pub provider: String,
    /// GPU class (e.g. "T4", "P100").
    #[serde(default)]
    pub gpu_class: String,
    #[serde(default = "default_daily_quota")]
    pub daily_quota_secs: u64,
    #[serde(default = "default_max_session")]
    pub max_session_secs: u64,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Lead time before session expiry at which the next node starts warming.
    #[serde(default = "default_prestart_before")]
    pub prestart_before_secs: u64,
    #[serde(default)]
    pub is_emergency: bool,
    #[serde(default)]
    pub can_quick_start: bool,
    #[serde(default = "default_estimated_start")]
    pub estimated_start_secs: u64,
}

fn default_daily_quota() -> u64 {
    12 * 60 * 60
}

fn default_max_session() -> u64 {
    12 * 60 * 60
}

fn default_priority() -> u32 {
    100
}

fn default_prestart_before() -> u64 {
    10 * 60
}

fn default_estimated_start() -> u64 {
    120
}

/// One upstream compute account/session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub provider: String,
    pub gpu_class: String,
    pub status: NodeStatus,

    pub daily_quota_secs: u64,
    pub used_quota_secs: u64,
    /// When `used_quota_secs` next resets to zero.
    pub quota_reset_at: u64,

    pub max_session_secs: u64,
    /// Set while the node is `Running`.
    pub session_start_at: Option<u64>,

    pub priority: u32,
    pub prestart_before_secs: u64,
    pub is_emergency: bool,
    pub can_quick_start: bool,
    pub estimated_start_secs: u64,

    pub scheduled_start_at: Option<u64>,
    pub scheduled_stop_at: Option<u64>,

    // Telemetry. Advisory only.
    pub utilization: f64,
    pub temperature_c: Option<f64>,
    pub running_tasks: u32,
    pub completed_tasks: u64,

    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// Build a stopped node with a fresh quota day starting at `now`.
    pub fn from_spec(spec: NodeSpec, now: u64) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            provider: spec.provider,
            gpu_class: spec.gpu_class,
            status: NodeStatus::Stopped,
            daily_quota_secs: spec.daily_quota_secs,
            used_quota_secs: 0,
            quota_reset_at: now + DAY_SECS,
            max_session_secs: spec.max_session_secs,
            session_start_at: None,
            priority: spec.priority,
            prestart_before_secs: spec.prestart_before_secs,
            is_emergency: spec.is_emergency,
            can_quick_start: spec.can_quick_start,
            estimated_start_secs: spec.estimated_start_secs,
            scheduled_start_at: None,
            scheduled_stop_at: None,
            utilization: 0.0,
            temperature_c: None,
            running_tasks: 0,
            completed_tasks: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Quota left today. Never negative.
    pub fn remaining_quota_secs(&self) -> u64 {
        self.daily_quota_secs.saturating_sub(self.used_quota_secs)
    }

    /// Session time left at `now`, or `None` when no session is running.
    pub fn remaining_session_secs(&self, now: u64) -> Option<u64> {
        self.session_start_at
            .map(|start| (start + self.max_session_secs).saturating_sub(now))
    }

    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }
}

// ── Events ────────────────────────────────────────────────────────

/// Kind of a node lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    StatusChanged,
    SessionStarted,
    EmergencyActivated,
    PrestartTriggered,
    QuotaWarning,
    QuotaReset,
}

/// Immutable record of something that happened to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub node_name: String,
    pub kind: NodeEventKind,
    pub old_status: Option<NodeStatus>,
    pub new_status: Option<NodeStatus>,
    pub message: String,
    pub timestamp: u64,
}

impl NodeEvent {
    /// An event about `node` that carries no status transition.
    pub fn new(node: &Node, kind: NodeEventKind, message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            kind,
            old_status: None,
            new_status: None,
            message: message.into(),
            timestamp,
        }
    }

    pub fn with_transition(mut self, old: NodeStatus, new: NodeStatus) -> Self {
        self.old_status = Some(old);
        self.new_status = Some(new);
        self
    }
}

// ── Scheduling config ─────────────────────────────────────────────

/// Policy used to pick the next node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MaxQuota,
    FastestStart,
    #[default]
    SmartBalance,
    RoundRobin,
}

/// Process-wide scheduling tunables, read by every monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    pub strategy: Strategy,
    /// Fraction of the daily quota (0.0–1.0) below which quota counts as low.
    pub quota_warning_threshold: f64,
    /// Remaining session time at which a session warning fires.
    pub session_warning_lead_secs: u64,
    pub auto_switch_on_error: bool,
    pub auto_switch_on_low_quota: bool,
    pub enable_emergency_nodes: bool,
    pub enable_smart_scheduling: bool,
    pub auto_prestart: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::SmartBalance,
            quota_warning_threshold: 0.1,
            session_warning_lead_secs: 10 * 60,
            auto_switch_on_error: true,
            auto_switch_on_low_quota: true,
            enable_emergency_nodes: true,
            enable_smart_scheduling: true,
            auto_prestart: true,
        }
    }
}

impl SchedulingConfig {
    /// Remaining-quota level (seconds) at which quota is considered low.
    pub fn quota_warning_level(&self, daily_quota_secs: u64) -> u64 {
        (daily_quota_secs as f64 * self.quota_warning_threshold.clamp(0.0, 1.0)) as u64
    }
}

/// Aggregate view over all nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeStats {
    pub total_nodes: usize,
    pub by_status: BTreeMap<NodeStatus, usize>,
    pub total_quota_secs: u64,
    pub used_quota_secs: u64,
    pub remaining_quota_secs: u64,
    pub average_utilization: f64,
    pub active_node_id: Option<NodeId>,
    /// Seconds until the active node runs out of session or quota.
    pub next_switch_in_secs: Option<u64>,
    pub updated_at: u64,
}

impl NodeStats {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

// ── Worker ────────────────────────────────────────────────────────

/// Connectivity/occupancy of a generation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Offline,
    Connecting,
    Online,
    Busy,
}

/// Registration payload for a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub name: String,
    /// Listen address (`host:port`, optionally `http://`-prefixed).
    pub address: String,
}

/// One generation backend instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub address: String,
    pub status: WorkerStatus,
    pub gpu_name: Option<String>,
    pub total_vram_gb: f64,
    pub free_vram_gb: f64,
    pub current_model: Option<String>,
    /// Busy iff set.
    pub current_task: Option<TaskId>,
    pub added_at: u64,
    pub last_seen: Option<u64>,
    pub last_error: Option<String>,
}

impl Worker {
    pub fn from_spec(spec: WorkerSpec, now: u64) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            address: spec.address,
            status: WorkerStatus::Connecting,
            gpu_name: None,
            total_vram_gb: 0.0,
            free_vram_gb: 0.0,
            current_model: None,
            current_task: None,
            added_at: now,
            last_seen: None,
            last_error: None,
        }
    }

    /// Online with no task in flight.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Online && self.current_task.is_none()
    }
}

/// Aggregate view over all workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerStats {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
    pub connecting: usize,
    pub total_vram_gb: f64,
    pub free_vram_gb: f64,
}

// ── Worker wire contract ──────────────────────────────────────────

/// Body of a successful `GET /status` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusReport {
    pub gpu_name: String,
    pub total_vram_gb: f64,
    pub free_vram_gb: f64,
    #[serde(default)]
    pub current_model: Option<String>,
}

/// Body of `POST /generate` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
    /// `None` lets the worker pick a random seed.
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub model_id: Option<String>,
}

fn default_batch_size() -> u32 {
    1
}

/// Body of a successful `POST /generate` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<GenerationOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    #[serde(default)]
    pub images: Vec<String>,
    pub seed: i64,
    pub generation_time_seconds: f64,
}

// ── Task ──────────────────────────────────────────────────────────

/// What kind of generation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    TextToImage,
    ImageToImage,
    Inpaint,
    Upscale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A dispatched generation request while it is live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
}
