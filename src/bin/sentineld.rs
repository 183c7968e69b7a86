//! sentineld - multi-camera anomaly detection daemon
//!
//! This daemon:
//! 1. Loads configuration (file from SENTINEL_CONFIG or --config, then env)
//! 2. Starts one capture stream, gate watcher and detection loop per camera
//! 3. Logs fleet health periodically
//! 4. Stops everything with bounded waits on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use anomaly_sentinel::{FleetSupervisor, SentinelConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,
    /// Only load and validate the configuration, then exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SentinelConfig::load_from(path)?,
        None => SentinelConfig::load()?,
    };
    log::info!(
        "sentineld {}: {} camera(s), api {}, model {:?}",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len(),
        config.api.url,
        config.model.kind
    );
    if config.model.is_placeholder() {
        log::warn!(
            "model.kind is \"stub\": detections come from a brightness heuristic, not a trained model; set model.kind = \"onnx\" and model.path for production"
        );
    }
    if args.check {
        log::info!("configuration OK");
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let fleet = FleetSupervisor::start(&config)?;
    log::info!(
        "sentineld running {} of {} camera(s); waiting for Ctrl-C",
        fleet.units().len(),
        config.cameras.len()
    );
    fleet.run_until(&rx);
    log::info!("shutdown signal received, stopping cameras...");
    fleet.shutdown();
    Ok(())
}
