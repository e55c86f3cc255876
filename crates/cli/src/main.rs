mod cli;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use throttle_core::{load_dotenv, ThrottleConfig};
use throttle_scheduler::Manager;

use crate::cli::SimArgs;
use crate::workload::Workload;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = SimArgs::parse();

    let config = match args.config.as_deref() {
        Some(path) => ThrottleConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => {
            let config = ThrottleConfig::from_env();
            config.validate().context("invalid configuration")?;
            config
        }
    };
    config.log_summary();

    let manager = Manager::new(config);
    manager.start().context("failed to start manager")?;

    if args.pause_secs > 0 {
        manager.pause_background(Duration::from_secs(args.pause_secs));
    }

    let workload = Workload::from_args(&args);
    let summary = workload::run(&manager, &workload).await;

    manager.stop().await.context("failed to stop manager")?;
    info!("simulation finished");

    let report = json!({
        "summary": summary,
        "stats": manager.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
