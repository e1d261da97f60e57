use anyhow::Result;
use clap::Parser;
use tracing::info;

mod artifacts;
mod config;
mod dataset;
mod db;
mod error;
mod model;
mod pipeline;

use config::Config;

fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    info!(
        command = ?config.command,
        artifacts = %config.artifacts_dir.display(),
        regulation_innings = config.regulation_innings,
        max_run_diff = config.max_run_diff,
        "Starting"
    );

    pipeline::run(&config)
}
