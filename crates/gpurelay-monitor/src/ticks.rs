//! Background ticks.
//!
//! Two independent loops: a fast quota/session tick and a slower
//! scheduling tick. Each scans a snapshot of the registry so no lock is
//! held while events are recorded or published.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gpurelay_state::*;

use crate::events::{MonitorEvent, SwitchReason};
use crate::monitor::NodeMonitor;

/// Tick cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    pub quota_tick: Duration,
    pub schedule_tick: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            quota_tick: Duration::from_secs(5),
            schedule_tick: Duration::from_secs(30),
        }
    }
}

impl NodeMonitor {
    /// Spawn the quota and scheduling loops.
    ///
    /// Both stop when `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> [JoinHandle<()>; 2] {
        let quota = tokio::spawn(Arc::clone(self).run_quota_loop(shutdown.clone()));
        let schedule = tokio::spawn(Arc::clone(self).run_schedule_loop(shutdown));
        [quota, schedule]
    }

    async fn run_quota_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.ticks.quota_tick;
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; no time has elapsed yet.
        interval.tick().await;
        info!(interval = ?period, "quota tick started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.quota_tick(period.as_secs(), epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("quota tick shutting down");
                    break;
                }
            }
        }
    }

    async fn run_schedule_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.ticks.schedule_tick;
        let mut interval = tokio::time::interval(period);
        info!(interval = ?period, "scheduling tick started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scheduling_tick(epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("scheduling tick shutting down");
                    break;
                }
            }
        }
    }

    /// Advance quota and session counters by `elapsed_secs`.
    ///
    /// Only `Running` nodes are charged. The quota warning fires when this
    /// charge moves remaining quota into the warning band. The session
    /// warning fires once per session, on the first tick that finds the
    /// session inside its lead time, however far apart ticks really are.
    pub fn quota_tick(&self, elapsed_secs: u64, now: u64) {
        let config = self.config();

        for node in self.registry.list() {
            if node.status != NodeStatus::Running {
                continue;
            }
            self.charge_node(&node.id, elapsed_secs, now, &config);
        }

        if config.auto_prestart
            && let Some(active) = self.registry.active()
            && active.status == NodeStatus::Running
            && active
                .remaining_session_secs(now)
                .is_some_and(|left| left <= active.prestart_before_secs)
        {
            self.trigger_prestart(now);
        }

        self.emit(MonitorEvent::StatsUpdated(self.registry.stats(now)));
    }

    fn charge_node(&self, id: &str, elapsed_secs: u64, now: u64, config: &SchedulingConfig) {
        let mut before = None;
        let updated = match self.registry.update_info(id, |n| {
            // Re-checked under the lock; the snapshot may be stale.
            if n.status != NodeStatus::Running {
                return;
            }
            before = Some(n.remaining_quota_secs());
            n.used_quota_secs = (n.used_quota_secs + elapsed_secs).min(n.daily_quota_secs);
            n.updated_at = now;
        }) {
            Ok(node) => node,
            Err(e) => {
                warn!(node_id = %id, error = %e, "quota tick skipped node");
                return;
            }
        };
        let Some(before) = before else { return };
        let after = updated.remaining_quota_secs();

        if after == 0 {
            match self.apply_status(id, NodeStatus::QuotaExceeded, "daily quota exhausted", now) {
                Ok(_) => warn!(node_id = %id, "daily quota exhausted"),
                Err(e) => warn!(node_id = %id, error = %e, "quota tick skipped node"),
            }
            return;
        }

        let level = config.quota_warning_level(updated.daily_quota_secs);
        if before > level && after <= level {
            self.warn_node(
                &updated,
                format!("{after}s of daily quota left"),
                now,
            );
        }

        if let Some(session) = updated.remaining_session_secs(now)
            && session <= config.session_warning_lead_secs
            && self.first_session_warning(&updated)
        {
            self.warn_node(&updated, format!("{session}s of session left"), now);
        }
    }

    fn warn_node(&self, node: &Node, message: String, now: u64) {
        warn!(node_id = %node.id, %message, "quota warning");
        let event = NodeEvent::new(node, NodeEventKind::QuotaWarning, message, now);
        self.registry.record(event.clone());
        self.emit(MonitorEvent::QuotaWarning(event));
    }

    /// Consume due scheduled starts and stops, reset daily quotas, and
    /// decide a switch when the active node is failing or running low.
    pub fn scheduling_tick(&self, now: u64) {
        let config = self.config();

        for node in self.registry.list() {
            self.apply_schedule(&node, now);
            if now >= node.quota_reset_at {
                self.reset_quota(&node.id, now);
            }
        }

        if !config.enable_smart_scheduling {
            return;
        }
        let Some(active) = self.registry.active() else {
            debug!("no active node, nothing to switch");
            return;
        };

        let reason = if active.status.is_failed() && config.auto_switch_on_error {
            Some(SwitchReason::NodeFailed(active.status))
        } else if config.auto_switch_on_low_quota
            && active.remaining_quota_secs() < config.quota_warning_level(active.daily_quota_secs)
        {
            Some(SwitchReason::LowQuota)
        } else if active
            .remaining_session_secs(now)
            .is_some_and(|left| left < config.session_warning_lead_secs)
        {
            Some(SwitchReason::SessionExpiring)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.trigger_switch(reason, now);
        }
    }

    fn apply_schedule(&self, node: &Node, now: u64) {
        let start_due = node.scheduled_start_at.is_some_and(|at| at <= now);
        let stop_due = node.scheduled_stop_at.is_some_and(|at| at <= now);
        if !start_due && !stop_due {
            return;
        }

        if let Err(e) = self.registry.update_info(&node.id, |n| {
            if start_due {
                n.scheduled_start_at = None;
            }
            if stop_due {
                n.scheduled_stop_at = None;
            }
        }) {
            warn!(node_id = %node.id, error = %e, "scheduling tick skipped node");
            return;
        }

        // A stop due in the same tick wins over the start.
        let (status, message) = if stop_due {
            (NodeStatus::Stopped, "scheduled stop")
        } else {
            (NodeStatus::Starting, "scheduled start")
        };
        match self.apply_status(&node.id, status, message, now) {
            Ok(_) => info!(node_id = %node.id, to = ?status, "{message}"),
            Err(e) => warn!(node_id = %node.id, error = %e, "scheduling tick skipped node"),
        }
    }

    fn reset_quota(&self, id: &str, now: u64) {
        let mut reset = false;
        let mut was_exceeded = false;
        let node = match self.registry.update_info(id, |n| {
            if now < n.quota_reset_at {
                return;
            }
            reset = true;
            let days_behind = (now - n.quota_reset_at) / DAY_SECS + 1;
            n.quota_reset_at += days_behind * DAY_SECS;
            n.used_quota_secs = 0;
            n.updated_at = now;
            was_exceeded = n.status == NodeStatus::QuotaExceeded;
        }) {
            Ok(node) => node,
            Err(e) => {
                warn!(node_id = %id, error = %e, "quota reset skipped node");
                return;
            }
        };
        if !reset {
            return;
        }

        info!(node_id = %id, next_reset = node.quota_reset_at, "daily quota reset");
        let event = NodeEvent::new(&node, NodeEventKind::QuotaReset, "daily quota reset", now);
        self.registry.record(event.clone());
        self.emit(MonitorEvent::QuotaReset(event));

        if was_exceeded {
            if let Err(e) = self.apply_status(id, NodeStatus::Stopped, "quota replenished", now) {
                warn!(node_id = %id, error = %e, "quota reset skipped node");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::broadcast;

    const HOUR: u64 = 3600;
    const T0: u64 = 1_000_000;

    fn spec(id: &str, priority: u32) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            name: id.to_string(),
            provider: "colab".to_string(),
            gpu_class: "T4".to_string(),
            daily_quota_secs: 10 * HOUR,
            max_session_secs: 4 * HOUR,
            priority,
            prestart_before_secs: 600,
            is_emergency: false,
            can_quick_start: false,
            estimated_start_secs: 120,
        }
    }

    fn monitor(config: SchedulingConfig) -> NodeMonitor {
        let registry = Arc::new(NodeRegistry::new(Arc::new(EventLog::new())));
        NodeMonitor::new(registry, config, TickConfig::default())
    }

    /// Register nodes with a fixed clock so session and reset times are
    /// deterministic.
    fn add(m: &NodeMonitor, spec: NodeSpec) {
        m.registry().add_node(Node::from_spec(spec, T0)).unwrap();
    }

    fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn warnings(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::QuotaWarning(_)))
            .count()
    }

    #[test]
    fn only_running_nodes_are_charged() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();

        m.quota_tick(5, T0 + 5);
        m.quota_tick(5, T0 + 10);

        assert_eq!(m.node("a").unwrap().used_quota_secs, 10);
        assert_eq!(m.node("b").unwrap().used_quota_secs, 0);
    }

    #[test]
    fn quota_clamps_and_marks_exceeded() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        m.update_info("a", |n| n.used_quota_secs = n.daily_quota_secs - 3).unwrap();

        m.quota_tick(5, T0 + 5);

        let a = m.node("a").unwrap();
        assert_eq!(a.status, NodeStatus::QuotaExceeded);
        assert_eq!(a.used_quota_secs, a.daily_quota_secs);
        assert_eq!(a.remaining_quota_secs(), 0);

        // No longer Running: further ticks do not touch it.
        m.quota_tick(5, T0 + 10);
        assert_eq!(m.node("a").unwrap().used_quota_secs, a.daily_quota_secs);
    }

    #[test]
    fn quota_warning_fires_once_per_crossing() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        // Warning level is 10% of 10h = 3600s. Sit 7s above it.
        m.update_info("a", |n| n.used_quota_secs = n.daily_quota_secs - 3607).unwrap();
        let mut rx = m.subscribe();

        m.quota_tick(5, T0 + 5);
        assert_eq!(warnings(&drain(&mut rx)), 0);
        m.quota_tick(5, T0 + 10);
        assert_eq!(warnings(&drain(&mut rx)), 1);
        m.quota_tick(5, T0 + 15);
        m.quota_tick(5, T0 + 20);
        assert_eq!(warnings(&drain(&mut rx)), 0);

        assert_eq!(
            m.recent_events(50)
                .iter()
                .filter(|e| e.kind == NodeEventKind::QuotaWarning)
                .count(),
            1
        );
    }

    #[test]
    fn session_warning_fires_once_entering_band() {
        let config = SchedulingConfig {
            auto_prestart: false,
            ..SchedulingConfig::default()
        };
        let m = monitor(config);
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();

        // Session is 4h; lead is 600s. Band is entered at T0 + 4h - 600.
        let enter = T0 + 4 * HOUR - 600;
        m.quota_tick(5, enter - 5);
        assert_eq!(warnings(&drain(&mut rx)), 0);
        m.quota_tick(5, enter + 2);
        assert_eq!(warnings(&drain(&mut rx)), 1);
        m.quota_tick(5, enter + 7);
        assert_eq!(warnings(&drain(&mut rx)), 0);
    }

    #[test]
    fn session_warning_ignores_tick_jitter() {
        let config = SchedulingConfig {
            auto_prestart: false,
            ..SchedulingConfig::default()
        };
        let end = T0 + 4 * HOUR;

        // Ticks closer together than their nominal period.
        let m = monitor(config.clone());
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();
        m.quota_tick(5, end - 600);
        m.quota_tick(5, end - 596);
        assert_eq!(warnings(&drain(&mut rx)), 1);

        // Ticks further apart than their nominal period.
        let m = monitor(config);
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();
        m.quota_tick(5, end - 601);
        m.quota_tick(5, end - 595);
        m.quota_tick(5, end - 590);
        assert_eq!(warnings(&drain(&mut rx)), 1);
    }

    #[test]
    fn session_warning_rearms_on_new_session() {
        let config = SchedulingConfig {
            auto_prestart: false,
            ..SchedulingConfig::default()
        };
        let m = monitor(config);
        add(&m, spec("a", 1));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();

        m.quota_tick(5, T0 + 4 * HOUR - 300);
        assert_eq!(warnings(&drain(&mut rx)), 1);

        let restart = T0 + 5 * HOUR;
        m.registry().set_active_at("a", restart).unwrap();
        m.quota_tick(5, restart + 4 * HOUR - 300);
        m.quota_tick(5, restart + 4 * HOUR - 295);
        assert_eq!(warnings(&drain(&mut rx)), 1);
    }

    #[test]
    fn quota_tick_prestarts_successor_near_session_end() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();

        m.quota_tick(5, T0 + HOUR);
        assert_eq!(m.node("b").unwrap().status, NodeStatus::Stopped);

        // 4h session, 600s prestart lead.
        m.quota_tick(5, T0 + 4 * HOUR - 300);
        assert_eq!(m.node("b").unwrap().status, NodeStatus::Warming);
        assert_eq!(m.active_node().unwrap().id, "a");

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::NodePrestarted(n) if n.id == "b")));
        assert!(matches!(events.last(), Some(MonitorEvent::StatsUpdated(_))));
    }

    #[test]
    fn prestart_disabled_leaves_successor_stopped() {
        let config = SchedulingConfig {
            auto_prestart: false,
            ..SchedulingConfig::default()
        };
        let m = monitor(config);
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();

        m.quota_tick(5, T0 + 4 * HOUR - 300);
        assert_eq!(m.node("b").unwrap().status, NodeStatus::Stopped);
    }

    #[test]
    fn scheduled_start_and_stop_are_consumed() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.update_status("b", NodeStatus::Ready, "").unwrap();
        m.schedule_start("a", T0 + 100).unwrap();
        m.schedule_stop("b", T0 + 100).unwrap();

        m.scheduling_tick(T0 + 50);
        assert_eq!(m.node("a").unwrap().status, NodeStatus::Stopped);
        assert_eq!(m.node("b").unwrap().status, NodeStatus::Ready);

        m.scheduling_tick(T0 + 100);
        let a = m.node("a").unwrap();
        let b = m.node("b").unwrap();
        assert_eq!(a.status, NodeStatus::Starting);
        assert_eq!(a.scheduled_start_at, None);
        assert_eq!(b.status, NodeStatus::Stopped);
        assert_eq!(b.scheduled_stop_at, None);
    }

    #[test]
    fn quota_reset_replenishes_exceeded_node() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        m.update_info("a", |n| n.used_quota_secs = n.daily_quota_secs).unwrap();
        m.update_status("a", NodeStatus::QuotaExceeded, "").unwrap();
        let reset_at = m.node("a").unwrap().quota_reset_at;
        let mut rx = m.subscribe();

        // Two and a half days late.
        let now = reset_at + 2 * DAY_SECS + DAY_SECS / 2;
        m.scheduling_tick(now);

        let a = m.node("a").unwrap();
        assert_eq!(a.used_quota_secs, 0);
        assert_eq!(a.status, NodeStatus::Stopped);
        assert_eq!(a.quota_reset_at, reset_at + 3 * DAY_SECS);
        assert!(a.quota_reset_at > now);

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(MonitorEvent::QuotaReset(_))));
    }

    #[test]
    fn low_quota_on_active_node_requires_switch() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();
        m.update_info("a", |n| n.used_quota_secs = n.daily_quota_secs - 600).unwrap();
        let mut rx = m.subscribe();

        m.scheduling_tick(T0 + 60);

        let events = drain(&mut rx);
        let notice = events
            .iter()
            .find_map(|e| match e {
                MonitorEvent::SwitchRequired(n) => Some(n.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(notice.reason, SwitchReason::LowQuota);
        assert_eq!(notice.next.id, "b");

        // Signalled once.
        m.scheduling_tick(T0 + 90);
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, MonitorEvent::SwitchRequired(_)))
        );
    }

    #[test]
    fn failed_active_node_switches_when_enabled() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();
        m.update_status("a", NodeStatus::Disconnected, "lost").unwrap();
        let mut rx = m.subscribe();

        m.scheduling_tick(T0 + 60);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            MonitorEvent::SwitchRequired(n)
                if n.reason == SwitchReason::NodeFailed(NodeStatus::Disconnected)
        )));
    }

    #[test]
    fn healthy_active_node_needs_no_switch() {
        let m = monitor(SchedulingConfig::default());
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();
        let mut rx = m.subscribe();

        m.scheduling_tick(T0 + 60);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn smart_scheduling_disabled_never_switches() {
        let config = SchedulingConfig {
            enable_smart_scheduling: false,
            ..SchedulingConfig::default()
        };
        let m = monitor(config);
        add(&m, spec("a", 1));
        add(&m, spec("b", 2));
        m.registry().set_active_at("a", T0).unwrap();
        m.update_status("a", NodeStatus::Error, "").unwrap();
        let mut rx = m.subscribe();

        m.scheduling_tick(T0 + 60);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let m = Arc::new(monitor(SchedulingConfig::default()));
        let (tx, rx) = watch::channel(false);
        let handles = m.spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
