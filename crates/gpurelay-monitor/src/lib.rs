//! gpurelay-monitor — node lifecycle monitor and switch scheduler.
//!
//! Decides which compute node should be active, when to warm up its
//! successor, and when to switch. It only decides: starting and stopping
//! provider sessions is left to whoever subscribes to the notifications.
//!
//! # Architecture
//!
//! ```text
//! NodeMonitor
//!   ├── NodeRegistry (shared, snapshot-iterated by ticks)
//!   ├── SchedulingConfig (read by every tick, replaced via set_config)
//!   ├── RoundRobinCursor (the only stateful selection input)
//!   ├── quota tick (every 5s)
//!   │   ├── advance used quota of Running nodes
//!   │   ├── QuotaExceeded at zero, edge-triggered warnings
//!   │   └── prestart the successor of the active node
//!   ├── scheduling tick (every 30s)
//!   │   ├── scheduled start/stop, daily quota reset
//!   │   └── switch (or emergency activation) when the active node runs low
//!   └── broadcast::Sender<MonitorEvent> for subscribers
//! ```
//!
//! Per-node faults inside a tick are logged and skipped; one bad node
//! never stops the scan.

pub mod events;
pub mod monitor;
pub mod ticks;

pub use events::{MonitorEvent, SwitchNotice, SwitchReason};
pub use monitor::NodeMonitor;
pub use ticks::TickConfig;
