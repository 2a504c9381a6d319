//! Node registry — authoritative in-memory map of compute nodes.
//!
//! Tracks each node's status, quota and session counters, and which node
//! (if any) is active. Status transitions are appended to the shared
//! [`EventLog`] while the write lock is held, so the log orders each
//! node's events exactly as its transitions were applied. Lock order is
//! always registry, then log.
//!
//! The registry does not validate transitions. Any status may follow any
//! other: operators override statuses by hand, and callers own the
//! sequencing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::epoch_secs;
use crate::error::{StateError, StateResult};
use crate::events::EventLog;
use crate::types::*;

#[derive(Default)]
struct Nodes {
    nodes: HashMap<NodeId, Node>,
    active: Option<NodeId>,
}

/// Concurrent node map plus the active-node pointer.
pub struct NodeRegistry {
    inner: RwLock<Nodes>,
    events: Arc<EventLog>,
}

impl NodeRegistry {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            inner: RwLock::new(Nodes::default()),
            events,
        }
    }

    /// The event log this registry appends to.
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Register a node. Ids must be unique.
    pub fn add_node(&self, node: Node) -> StateResult<()> {
        let mut inner = self.write();
        if inner.nodes.contains_key(&node.id) {
            return Err(StateError::NodeAlreadyExists(node.id));
        }
        info!(node_id = %node.id, name = %node.name, provider = %node.provider, "node registered");
        inner.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node.
    ///
    /// Refuses with [`StateError::NodeBusy`] when the node is active and
    /// still running work.
    pub fn remove_node(&self, id: &str) -> StateResult<Node> {
        let mut inner = self.write();
        let node = inner
            .nodes
            .get(id)
            .ok_or_else(|| StateError::NodeNotFound(id.to_string()))?;

        let is_active = inner.active.as_deref() == Some(id);
        if is_active && (node.status == NodeStatus::Running || node.running_tasks > 0) {
            return Err(StateError::NodeBusy(id.to_string()));
        }

        if is_active {
            inner.active = None;
        }
        let node = inner
            .nodes
            .remove(id)
            .ok_or_else(|| StateError::NodeNotFound(id.to_string()))?;
        info!(node_id = %id, "node removed");
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.read().nodes.get(id).cloned()
    }

    /// Snapshot of every node, ordered by id.
    pub fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_id(&self) -> Option<NodeId> {
        self.read().active.clone()
    }

    pub fn active(&self) -> Option<Node> {
        let inner = self.read();
        inner.active.as_ref().and_then(|id| inner.nodes.get(id)).cloned()
    }

    /// Set a node's status and record the transition.
    pub fn update_status(
        &self,
        id: &str,
        status: NodeStatus,
        message: impl Into<String>,
    ) -> StateResult<NodeEvent> {
        self.update_status_at(id, status, message, epoch_secs())
    }

    /// [`update_status`](Self::update_status) with an explicit clock.
    ///
    /// Entering `Running` stamps `session_start_at`; leaving it clears the
    /// session. Quota usage is never touched.
    pub fn update_status_at(
        &self,
        id: &str,
        status: NodeStatus,
        message: impl Into<String>,
        now: u64,
    ) -> StateResult<NodeEvent> {
        let event = {
            let mut inner = self.write();
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| StateError::NodeNotFound(id.to_string()))?;

            let old = node.status;
            node.status = status;
            node.updated_at = now;
            if status == NodeStatus::Running {
                if old != NodeStatus::Running || node.session_start_at.is_none() {
                    node.session_start_at = Some(now);
                }
            } else if old == NodeStatus::Running {
                node.session_start_at = None;
            }

            let event = NodeEvent::new(node, NodeEventKind::StatusChanged, message, now)
                .with_transition(old, status);
            // Logged under the write lock so a node's events follow its
            // transition order.
            self.events.push(event.clone());
            event
        };

        debug!(node_id = %id, from = ?event.old_status, to = ?status, "node status changed");
        Ok(event)
    }

    /// Apply a bulk edit to a node and return the updated copy.
    ///
    /// No event is recorded; use [`update_status`](Self::update_status)
    /// for status transitions that observers should see.
    pub fn update_info<F>(&self, id: &str, mutate: F) -> StateResult<Node>
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| StateError::NodeNotFound(id.to_string()))?;
        mutate(node);
        Ok(node.clone())
    }

    /// Mark `id` as the active node: `Running`, with a new session.
    ///
    /// A previously active node is left untouched. Tearing it down is the
    /// caller's job, which allows a cutover to be staged before the old
    /// node stops.
    pub fn set_active(&self, id: &str) -> StateResult<NodeEvent> {
        self.set_active_at(id, epoch_secs())
    }

    pub fn set_active_at(&self, id: &str, now: u64) -> StateResult<NodeEvent> {
        let (event, previous) = {
            let mut inner = self.write();
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| StateError::NodeNotFound(id.to_string()))?;

            let old = node.status;
            node.status = NodeStatus::Running;
            node.session_start_at = Some(now);
            node.updated_at = now;
            let event = NodeEvent::new(node, NodeEventKind::SessionStarted, "session started", now)
                .with_transition(old, NodeStatus::Running);

            let previous = inner.active.replace(id.to_string());
            self.events.push(event.clone());
            (event, previous)
        };

        info!(node_id = %id, previous = ?previous, "active node set");
        Ok(event)
    }

    /// Append a non-transition event (warnings, prestarts, resets).
    pub fn record(&self, event: NodeEvent) {
        self.events.push(event);
    }

    /// Aggregate counters over all nodes at `now`.
    pub fn stats(&self, now: u64) -> NodeStats {
        let inner = self.read();
        let mut stats = NodeStats {
            total_nodes: inner.nodes.len(),
            updated_at: now,
            ..NodeStats::default()
        };

        let mut running = 0usize;
        let mut utilization = 0.0;
        for node in inner.nodes.values() {
            *stats.by_status.entry(node.status).or_insert(0) += 1;
            stats.total_quota_secs += node.daily_quota_secs;
            stats.used_quota_secs += node.used_quota_secs.min(node.daily_quota_secs);
            stats.remaining_quota_secs += node.remaining_quota_secs();
            if node.status == NodeStatus::Running {
                running += 1;
                utilization += node.utilization;
            }
        }
        if running > 0 {
            stats.average_utilization = utilization / running as f64;
        }

        if let Some(active) = inner.active.as_ref().and_then(|id| inner.nodes.get(id)) {
            stats.active_node_id = Some(active.id.clone());
            let quota = active.remaining_quota_secs();
            stats.next_switch_in_secs = Some(match active.remaining_session_secs(now) {
                Some(session) => session.min(quota),
                None => quota,
            });
        }

        stats
    }

    fn read(&self) -> RwLockReadGuard<'_, Nodes> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Nodes> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(EventLog::with_capacity(50)))
    }

    fn node(id: &str) -> Node {
        Node::from_spec(
            NodeSpec {
                id: id.to_string(),
                name: format!("node {id}"),
                provider: "colab".to_string(),
                gpu_class: "T4".to_string(),
                daily_quota_secs: 4 * 3600,
                max_session_secs: 2 * 3600,
                priority: 1,
                prestart_before_secs: 600,
                is_emergency: false,
                can_quick_start: false,
                estimated_start_secs: 90,
            },
            1000,
        )
    }

    #[test]
    fn add_rejects_duplicate_ids() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        assert_eq!(
            reg.add_node(node("a")),
            Err(StateError::NodeAlreadyExists("a".to_string()))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_is_sorted_by_id() {
        let reg = registry();
        for id in ["c", "a", "b"] {
            reg.add_node(node(id)).unwrap();
        }
        let ids: Vec<String> = reg.list().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_refuses_busy_active_node() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.set_active_at("a", 2000).unwrap();

        assert_eq!(reg.remove_node("a"), Err(StateError::NodeBusy("a".to_string())));
        assert!(reg.get("a").is_some());
    }

    #[test]
    fn remove_active_idle_node_clears_active() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.set_active_at("a", 2000).unwrap();
        reg.update_status_at("a", NodeStatus::Stopped, "manual stop", 2100).unwrap();

        reg.remove_node("a").unwrap();
        assert_eq!(reg.active_id(), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_inactive_running_node_is_allowed() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.update_status_at("a", NodeStatus::Running, "", 2000).unwrap();
        assert!(reg.remove_node("a").is_ok());
    }

    #[test]
    fn remove_unknown_node_fails() {
        let reg = registry();
        assert_eq!(
            reg.remove_node("ghost"),
            Err(StateError::NodeNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn any_status_is_reachable_from_any_other() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();

        let jumps = [
            NodeStatus::QuotaExceeded,
            NodeStatus::Ready,
            NodeStatus::Emergency,
            NodeStatus::Queued,
            NodeStatus::Running,
            NodeStatus::Disconnected,
            NodeStatus::Stopped,
            NodeStatus::Rebooting,
            NodeStatus::Warming,
            NodeStatus::Error,
            NodeStatus::Starting,
        ];
        for (i, status) in jumps.into_iter().enumerate() {
            let event = reg.update_status_at("a", status, "override", 2000 + i as u64);
            assert!(event.is_ok(), "jump to {status:?} must not be an error");
            assert_eq!(reg.get("a").unwrap().status, status);
        }
    }

    #[test]
    fn entering_running_stamps_session_and_leaving_keeps_quota() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();

        reg.update_status_at("a", NodeStatus::Running, "started", 5000).unwrap();
        assert_eq!(reg.get("a").unwrap().session_start_at, Some(5000));

        reg.update_info("a", |n| n.used_quota_secs = 1200).unwrap();
        reg.update_status_at("a", NodeStatus::Stopped, "stopped", 6200).unwrap();

        let n = reg.get("a").unwrap();
        assert_eq!(n.session_start_at, None);
        assert_eq!(n.used_quota_secs, 1200);
    }

    #[test]
    fn repeated_running_keeps_original_session_start() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.update_status_at("a", NodeStatus::Running, "", 5000).unwrap();
        reg.update_status_at("a", NodeStatus::Running, "", 5100).unwrap();
        assert_eq!(reg.get("a").unwrap().session_start_at, Some(5000));
    }

    #[test]
    fn update_status_records_transition_event() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();

        let event = reg.update_status_at("a", NodeStatus::Error, "kernel died", 3000).unwrap();
        assert_eq!(event.kind, NodeEventKind::StatusChanged);
        assert_eq!(event.old_status, Some(NodeStatus::Stopped));
        assert_eq!(event.new_status, Some(NodeStatus::Error));
        assert_eq!(event.message, "kernel died");

        let logged = reg.events().recent(1);
        assert_eq!(logged, vec![event]);
    }

    #[test]
    fn set_active_does_not_stop_previous_node() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.add_node(node("b")).unwrap();

        reg.set_active_at("a", 1000).unwrap();
        reg.set_active_at("b", 2000).unwrap();

        // The registry permits a staged cutover: both appear Running until
        // the caller tears `a` down.
        assert_eq!(reg.active_id().as_deref(), Some("b"));
        assert_eq!(reg.get("a").unwrap().status, NodeStatus::Running);
        assert_eq!(reg.get("b").unwrap().status, NodeStatus::Running);
        assert_eq!(reg.get("b").unwrap().session_start_at, Some(2000));
    }

    #[test]
    fn set_active_emits_session_started() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        let event = reg.set_active_at("a", 1500).unwrap();
        assert_eq!(event.kind, NodeEventKind::SessionStarted);
        assert_eq!(event.new_status, Some(NodeStatus::Running));
    }

    #[test]
    fn unknown_node_operations_fail() {
        let reg = registry();
        assert!(reg.update_status("x", NodeStatus::Ready, "").is_err());
        assert!(reg.set_active("x").is_err());
        assert!(reg.update_info("x", |_| {}).is_err());
    }

    #[test]
    fn stats_aggregate_quota_and_next_switch() {
        let reg = registry();
        reg.add_node(node("a")).unwrap();
        reg.add_node(node("b")).unwrap();
        reg.update_info("a", |n| {
            n.used_quota_secs = 3 * 3600;
            n.utilization = 80.0;
        })
        .unwrap();
        reg.set_active_at("a", 10_000).unwrap();

        let stats = reg.stats(10_600);
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.count(NodeStatus::Running), 1);
        assert_eq!(stats.count(NodeStatus::Stopped), 1);
        assert_eq!(stats.total_quota_secs, 8 * 3600);
        assert_eq!(stats.used_quota_secs, 3 * 3600);
        assert_eq!(stats.remaining_quota_secs, 5 * 3600);
        assert_eq!(stats.average_utilization, 80.0);
        assert_eq!(stats.active_node_id.as_deref(), Some("a"));
        // Session has 6600s left, quota 3600s: quota runs out first.
        assert_eq!(stats.next_switch_in_secs, Some(3600));
    }

    #[test]
    fn concurrent_transitions_are_logged_in_order() {
        use std::thread;

        const STATUSES: [NodeStatus; 4] = [
            NodeStatus::Queued,
            NodeStatus::Warming,
            NodeStatus::Ready,
            NodeStatus::Error,
        ];

        let reg = Arc::new(NodeRegistry::new(Arc::new(EventLog::with_capacity(1000))));
        reg.add_node(node("a")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for i in 0..50 {
                        reg.update_status_at("a", STATUSES[(t + i) % STATUSES.len()], "", 2000)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = reg.events().recent(1000);
        assert_eq!(events.len(), 400);
        assert_eq!(events[0].old_status, Some(NodeStatus::Stopped));
        for pair in events.windows(2) {
            assert_eq!(pair[1].old_status, pair[0].new_status);
        }
        assert_eq!(events[399].new_status, Some(reg.get("a").unwrap().status));
    }
}
