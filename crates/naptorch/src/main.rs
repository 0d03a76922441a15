//! naptorch entry point.
//!
//! Runs the NAPT control plane against in-memory collaborators until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use napt_orchagent::audit::init_logging;
use napt_orchagent::{NaptConfig, NaptDaemon, NaptServices};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// NAPT orchestration agent
#[derive(Parser, Debug)]
#[command(name = "naptorch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Heartbeat interval in milliseconds, overrides the file
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Reconciliation interval in milliseconds, overrides the file
    #[arg(long)]
    reconcile_interval: Option<u64>,
}

fn load_config(args: &Args) -> anyhow::Result<NaptConfig> {
    let mut config = match &args.config {
        Some(path) => NaptConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NaptConfig::default(),
    };
    if let Some(ms) = args.heartbeat_interval {
        config.daemon.heartbeat_interval_ms = ms;
    }
    if let Some(ms) = args.reconcile_interval {
        config.daemon.reconcile_interval_ms = Some(ms);
    }
    config.validate().context("command line overrides")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        mode = ?config.translation.mode,
        ports = %format!("{}-{}", config.pools.port_range.low, config.pools.port_range.high),
        heartbeat_ms = config.daemon.heartbeat_interval_ms,
        "starting naptorch (in-memory collaborators)"
    );

    let mut daemon = NaptDaemon::new(config, NaptServices::in_memory());
    let token = daemon.shutdown_token();
    let shutdown_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("received SIGINT, shutting down");
                token.cancel();
            }
            Err(err) => error!("failed to listen for ctrl-c: {err}"),
        }
    });

    daemon.run().await;
    shutdown_handle.abort();

    info!("naptorch shutdown complete");
    ExitCode::SUCCESS
}
