//! gpurelayd — the gpurelay daemon.
//!
//! Single binary that assembles all gpurelay subsystems:
//! - Node monitor (quota tick + scheduling tick)
//! - Worker health checker (one poll loop per worker)
//! - Task dispatcher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! gpurelayd run --config /etc/gpurelay/gpurelay.toml
//! gpurelayd check-config --config /etc/gpurelay/gpurelay.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gpurelayd::config::LogFormat;
use gpurelayd::{Daemon, DaemonConfig};

const DEFAULT_LOG_FILTER: &str = "info,gpurelayd=debug,gpurelay=debug";

#[derive(Parser)]
#[command(name = "gpurelayd", about = "gpurelay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator and its API server.
    Run {
        /// Config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Log as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Parse and validate a config file, then print the effective config.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            listen,
            log_json,
        } => {
            let mut config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            if let Some(listen) = listen {
                config.server.listen = listen;
                config.validate()?;
            }
            init_tracing(log_json || config.server.log_format == LogFormat::Json);
            run(config).await
        }
        Command::CheckConfig { config } => {
            let config = DaemonConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("gpurelay daemon starting");

    let daemon = Daemon::build(&config)?;
    info!(
        strategy = ?daemon.monitor.config().strategy,
        quota_tick = ?daemon.monitor.tick_config().quota_tick,
        schedule_tick = ?daemon.monitor.tick_config().schedule_tick,
        "subsystems initialized"
    );

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = daemon.start(shutdown_rx).await;

    // ── API server ─────────────────────────────────────────────

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, daemon.router()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    daemon.health.stop_all().await;
    for handle in handles {
        let _ = handle.await;
    }

    info!("gpurelay daemon stopped");
    Ok(())
}
