//! gpurelayd — the gpurelay daemon as a library, so integration tests can
//! assemble it without a listening socket.

pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::Daemon;
