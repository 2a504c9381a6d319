//! Daemon configuration (`gpurelay.toml`).
//!
//! Every section is optional. Durations are strings such as `"500ms"`,
//! `"5s"`, `"2m"` or `"1h"`; a bare number means seconds.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use gpurelay_health::{HealthConfig, check_address};
use gpurelay_monitor::TickConfig;
use gpurelay_state::{NodeSpec, SchedulingConfig, Strategy, WorkerSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub scheduling: SchedulingSection,
    pub health: HealthSection,
    pub dispatch: DispatchSection,
    /// Nodes registered at startup.
    pub nodes: Vec<NodeSpec>,
    /// Workers registered (and polled) at startup.
    pub workers: Vec<WorkerSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8470".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub quota_tick: String,
    pub schedule_tick: String,
    pub event_log_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            quota_tick: "5s".to_string(),
            schedule_tick: "30s".to_string(),
            event_log_capacity: gpurelay_state::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// `[scheduling]`: [`SchedulingConfig`] with a duration string for the
/// session warning lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSection {
    pub strategy: Strategy,
    pub quota_warning_threshold: f64,
    pub session_warning_lead: String,
    pub auto_switch_on_error: bool,
    pub auto_switch_on_low_quota: bool,
    pub enable_emergency_nodes: bool,
    pub enable_smart_scheduling: bool,
    pub auto_prestart: bool,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        let defaults = SchedulingConfig::default();
        Self {
            strategy: defaults.strategy,
            quota_warning_threshold: defaults.quota_warning_threshold,
            session_warning_lead: format!("{}s", defaults.session_warning_lead_secs),
            auto_switch_on_error: defaults.auto_switch_on_error,
            auto_switch_on_low_quota: defaults.auto_switch_on_low_quota,
            enable_emergency_nodes: defaults.enable_emergency_nodes,
            enable_smart_scheduling: defaults.enable_smart_scheduling,
            auto_prestart: defaults.auto_prestart,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub poll_interval: String,
    pub probe_timeout: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            poll_interval: "10s".to_string(),
            probe_timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub timeout: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            timeout: "10m".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Read and validate a config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.ticks()?;
        self.scheduling()?;
        self.health()?;
        self.dispatch_timeout()?;

        if self.monitor.event_log_capacity == 0 {
            bail!("monitor.event_log_capacity must be positive");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                bail!("node with empty id");
            }
            if !seen.insert(node.id.as_str()) {
                bail!("duplicate node id {:?}", node.id);
            }
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                bail!("worker with empty id");
            }
            if worker.address.trim().is_empty() {
                bail!("worker {:?} has no address", worker.id);
            }
            check_address(&worker.address).with_context(|| format!("worker {:?}", worker.id))?;
            if !seen.insert(worker.id.as_str()) {
                bail!("duplicate worker id {:?}", worker.id);
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("server.listen {:?} is not a socket address", self.server.listen))
    }

    pub fn ticks(&self) -> anyhow::Result<TickConfig> {
        Ok(TickConfig {
            quota_tick: positive_duration("monitor.quota_tick", &self.monitor.quota_tick)?,
            schedule_tick: positive_duration("monitor.schedule_tick", &self.monitor.schedule_tick)?,
        })
    }

    pub fn scheduling(&self) -> anyhow::Result<SchedulingConfig> {
        let s = &self.scheduling;
        if !(0.0..=1.0).contains(&s.quota_warning_threshold) {
            bail!(
                "scheduling.quota_warning_threshold {} is outside [0, 1]",
                s.quota_warning_threshold
            );
        }
        Ok(SchedulingConfig {
            strategy: s.strategy,
            quota_warning_threshold: s.quota_warning_threshold,
            session_warning_lead_secs: duration("scheduling.session_warning_lead", &s.session_warning_lead)?
                .as_secs(),
            auto_switch_on_error: s.auto_switch_on_error,
            auto_switch_on_low_quota: s.auto_switch_on_low_quota,
            enable_emergency_nodes: s.enable_emergency_nodes,
            enable_smart_scheduling: s.enable_smart_scheduling,
            auto_prestart: s.auto_prestart,
        })
    }

    pub fn health(&self) -> anyhow::Result<HealthConfig> {
        Ok(HealthConfig {
            poll_interval: positive_duration("health.poll_interval", &self.health.poll_interval)?,
            probe_timeout: positive_duration("health.probe_timeout", &self.health.probe_timeout)?,
        })
    }

    pub fn dispatch_timeout(&self) -> anyhow::Result<Duration> {
        positive_duration("dispatch.timeout", &self.dispatch.timeout)
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"`, `"1h"` or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("{field}: invalid duration {value:?}"))
}

fn positive_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    let d = duration(field, value)?;
    if d.is_zero() {
        bail!("{field} must be positive");
    }
    Ok(d)
}
