//! Notifications published by the node monitor.

use std::fmt;

use serde::Serialize;

use gpurelay_state::{Node, NodeEvent, NodeStats, NodeStatus};

/// Why a switch away from the active node is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum SwitchReason {
    LowQuota,
    SessionExpiring,
    NodeFailed(NodeStatus),
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchReason::LowQuota => write!(f, "active node quota is low"),
            SwitchReason::SessionExpiring => write!(f, "active node session is expiring"),
            SwitchReason::NodeFailed(status) => write!(f, "active node is {status:?}"),
        }
    }
}

/// A switch decision. Executing it is the subscriber's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchNotice {
    pub current: Node,
    pub next: Node,
    pub reason: SwitchReason,
    /// `next` is a reserve node that was emergency-activated.
    pub emergency: bool,
}

/// Everything a monitor subscriber can observe.
///
/// Each is published once, after the state change it describes has been
/// applied to the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum MonitorEvent {
    NodeStatusChanged(NodeEvent),
    SessionStarted(NodeEvent),
    QuotaWarning(NodeEvent),
    QuotaReset(NodeEvent),
    StatsUpdated(NodeStats),
    SwitchRequired(SwitchNotice),
    NodePrestarted(Node),
    EmergencyActivated(Node),
}

impl MonitorEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::NodeStatusChanged(_) => "node_status_changed",
            MonitorEvent::SessionStarted(_) => "session_started",
            MonitorEvent::QuotaWarning(_) => "quota_warning",
            MonitorEvent::QuotaReset(_) => "quota_reset",
            MonitorEvent::StatsUpdated(_) => "stats_updated",
            MonitorEvent::SwitchRequired(_) => "switch_required",
            MonitorEvent::NodePrestarted(_) => "node_prestarted",
            MonitorEvent::EmergencyActivated(_) => "emergency_activated",
        }
    }
}
