//! Node monitor — public API, prestart and switch decisions.
//!
//! External callers register and update nodes through the monitor rather
//! than the registry directly, so every change they make is published to
//! subscribers in the same order it was applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use gpurelay_placement::{RoundRobinCursor, select_emergency, select_next};
use gpurelay_state::*;

use crate::events::{MonitorEvent, SwitchNotice, SwitchReason};
use crate::ticks::TickConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tracks compute nodes and decides prestart, switch and emergency actions.
pub struct NodeMonitor {
    pub(crate) registry: Arc<NodeRegistry>,
    config: RwLock<SchedulingConfig>,
    pub(crate) ticks: TickConfig,
    cursor: RoundRobinCursor,
    events: broadcast::Sender<MonitorEvent>,
    /// Last switch signalled: (from, to).
    pending_switch: Mutex<Option<(NodeId, NodeId)>>,
    /// Active node whose successor has already been prestarted.
    prestarted_for: Mutex<Option<NodeId>>,
    /// Session start stamp of the last session warned about, per node.
    session_warned: Mutex<HashMap<NodeId, u64>>,
    /// Held across a status write and its broadcast, so subscribers see
    /// each node's transitions in the order they were applied.
    publish: Mutex<()>,
}

impl NodeMonitor {
    pub fn new(registry: Arc<NodeRegistry>, config: SchedulingConfig, ticks: TickConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            config: RwLock::new(config),
            ticks,
            cursor: RoundRobinCursor::new(),
            events,
            pending_switch: Mutex::new(None),
            prestarted_for: Mutex::new(None),
            session_warned: Mutex::new(HashMap::new()),
            publish: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Subscribe to monitor notifications.
    ///
    /// Delivery is at-most-once: a receiver that lags past the channel
    /// capacity loses the oldest notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Mark `node`'s current session as warned. `false` if it already was,
    /// or if no session is running.
    pub(crate) fn first_session_warning(&self, node: &Node) -> bool {
        let Some(start) = node.session_start_at else {
            return false;
        };
        let mut warned = self.session_warned.lock().unwrap_or_else(PoisonError::into_inner);
        warned.insert(node.id.clone(), start) != Some(start)
    }

    /// Apply a status transition and publish it.
    pub(crate) fn apply_status(
        &self,
        id: &str,
        status: NodeStatus,
        message: impl Into<String>,
        now: u64,
    ) -> StateResult<NodeEvent> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let event = self.registry.update_status_at(id, status, message, now)?;
        self.emit(MonitorEvent::NodeStatusChanged(event.clone()));
        Ok(event)
    }

    // ── Config ──────────────────────────────────────────────────────

    pub fn config(&self) -> SchedulingConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_config(&self, config: SchedulingConfig) {
        info!(strategy = ?config.strategy, "scheduling config updated");
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn tick_config(&self) -> TickConfig {
        self.ticks
    }

    // ── Registration and updates ────────────────────────────────────

    pub fn add_node(&self, spec: NodeSpec) -> StateResult<Node> {
        let node = Node::from_spec(spec, epoch_secs());
        self.registry.add_node(node.clone())?;
        Ok(node)
    }

    pub fn remove_node(&self, id: &str) -> StateResult<Node> {
        let node = self.registry.remove_node(id)?;
        self.session_warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(node)
    }

    pub fn update_status(
        &self,
        id: &str,
        status: NodeStatus,
        message: impl Into<String>,
    ) -> StateResult<NodeEvent> {
        self.apply_status(id, status, message, epoch_secs())
    }

    pub fn update_info<F>(&self, id: &str, mutate: F) -> StateResult<Node>
    where
        F: FnOnce(&mut Node),
    {
        self.registry.update_info(id, mutate)
    }

    /// Make `id` the active node and re-arm switch and prestart detection.
    ///
    /// The previously active node keeps its status; stopping it is the
    /// caller's responsibility.
    pub fn set_active(&self, id: &str) -> StateResult<NodeEvent> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let event = self.registry.set_active(id)?;
        *self.pending_switch.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.prestarted_for.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.emit(MonitorEvent::SessionStarted(event.clone()));
        Ok(event)
    }

    /// Start `id` once `at` has passed (checked by the scheduling tick).
    pub fn schedule_start(&self, id: &str, at: u64) -> StateResult<Node> {
        self.registry.update_info(id, |n| n.scheduled_start_at = Some(at))
    }

    /// Stop `id` once `at` has passed (checked by the scheduling tick).
    pub fn schedule_stop(&self, id: &str, at: u64) -> StateResult<Node> {
        self.registry.update_info(id, |n| n.scheduled_stop_at = Some(at))
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<Node> {
        self.registry.get(id)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.list()
    }

    pub fn active_node(&self) -> Option<Node> {
        self.registry.active()
    }

    /// The node that would be chosen next under the configured strategy.
    ///
    /// Under round-robin this advances the cursor, like any other pick.
    pub fn next_node(&self) -> Option<Node> {
        let strategy = self.config().strategy;
        let active = self.registry.active_id();
        select_next(&self.registry.list(), active.as_deref(), strategy, &self.cursor)
    }

    pub fn stats(&self) -> NodeStats {
        self.registry.stats(epoch_secs())
    }

    pub fn recent_events(&self, limit: usize) -> Vec<NodeEvent> {
        self.registry.events().recent(limit)
    }

    // ── Decisions ───────────────────────────────────────────────────

    /// Begin warming the active node's successor.
    ///
    /// Fires at most once per active session, and only moves a `Stopped`
    /// successor to `Warming`. Which node is active does not change.
    pub fn trigger_prestart(&self, now: u64) -> Option<Node> {
        let active = self.registry.active_id()?;
        {
            let done = self.prestarted_for.lock().unwrap_or_else(PoisonError::into_inner);
            if done.as_deref() == Some(active.as_str()) {
                return None;
            }
        }

        let strategy = self.config().strategy;
        let next = select_next(&self.registry.list(), Some(&active), strategy, &self.cursor)?;
        if next.status != NodeStatus::Stopped {
            debug!(node_id = %next.id, status = ?next.status, "successor already warm, no prestart");
            return None;
        }

        if let Err(e) = self.apply_status(
            &next.id,
            NodeStatus::Warming,
            "prestart before active session expires",
            now,
        ) {
            warn!(node_id = %next.id, error = %e, "prestart failed");
            return None;
        }

        let warmed = self.registry.get(&next.id).unwrap_or(next);
        self.registry.record(NodeEvent::new(
            &warmed,
            NodeEventKind::PrestartTriggered,
            format!("warming up as successor of {active}"),
            now,
        ));
        *self.prestarted_for.lock().unwrap_or_else(PoisonError::into_inner) = Some(active.clone());

        info!(node_id = %warmed.id, active = %active, "prestart triggered");
        self.emit(MonitorEvent::NodePrestarted(warmed.clone()));
        Some(warmed)
    }

    /// Decide a switch away from the active node.
    ///
    /// Picks a regular successor, or emergency-activates a reserve node
    /// when none exists and emergency nodes are enabled. Returns `None`
    /// when there is no active node or no candidate, when the same
    /// (current, next) pair was already signalled, or when the signalled
    /// target is already starting or running.
    pub fn trigger_switch(&self, reason: SwitchReason, now: u64) -> Option<SwitchNotice> {
        let current = self.registry.active()?;
        let pending = self
            .pending_switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|(from, _)| *from == current.id);

        if let Some((_, to)) = &pending
            && self
                .registry
                .get(to)
                .is_some_and(|n| matches!(n.status, NodeStatus::Starting | NodeStatus::Running))
        {
            debug!(from = %current.id, %to, "switch target already coming up");
            return None;
        }

        let config = self.config();
        let nodes = self.registry.list();

        if let Some(next) = select_next(&nodes, Some(&current.id), config.strategy, &self.cursor) {
            if pending.as_ref().is_some_and(|(_, to)| *to == next.id) {
                debug!(from = %current.id, to = %next.id, "switch already signalled");
                return None;
            }
            return Some(self.notify_switch(current, next, reason, false));
        }

        if !config.enable_emergency_nodes {
            debug!(node_id = %current.id, %reason, "no switch candidate");
            return None;
        }

        let Some(reserve) = select_emergency(&nodes, Some(&current.id)) else {
            warn!(node_id = %current.id, %reason, "no switch candidate and no emergency node");
            return None;
        };

        if let Err(e) = self.apply_status(&reserve.id, NodeStatus::Starting, "emergency activation", now)
        {
            warn!(node_id = %reserve.id, error = %e, "emergency activation failed");
            return None;
        }

        let reserve = self.registry.get(&reserve.id).unwrap_or(reserve);
        self.registry.record(NodeEvent::new(
            &reserve,
            NodeEventKind::EmergencyActivated,
            reason.to_string(),
            now,
        ));
        warn!(node_id = %reserve.id, active = %current.id, %reason, "emergency node activated");
        self.emit(MonitorEvent::EmergencyActivated(reserve.clone()));

        Some(self.notify_switch(current, reserve, reason, true))
    }

    fn notify_switch(
        &self,
        current: Node,
        next: Node,
        reason: SwitchReason,
        emergency: bool,
    ) -> SwitchNotice {
        *self.pending_switch.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((current.id.clone(), next.id.clone()));

        info!(from = %current.id, to = %next.id, %reason, emergency, "switch required");
        let notice = SwitchNotice {
            current,
            next,
            reason,
            emergency,
        };
        self.emit(MonitorEvent::SwitchRequired(notice.clone()));
        notice
    }
}
