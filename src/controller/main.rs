use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use applyfleet::controller;
use applyfleet::shared::{config::FleetConfig, logging};

#[derive(Parser)]
#[command(name = "applyfleet-controller")]
#[command(about = "Fleet controller - scaling, auto-stop, health and stuck-task reconciliation")]
struct Args {
    /// Path to the fleet config JSON
    #[arg(long, env = "FLEET_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long, env = "FLEET_LOG_DIR", default_value = "/app/logs")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guards = logging::init_service_logging(&args.log_dir, "applyfleet_controller")?;

    let (config, path) = FleetConfig::load(args.config.as_deref())?;
    tracing::info!("Loaded fleet config from {}", path.display());

    controller::run(config).await
}
