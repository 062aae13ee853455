//! keel - unified CLI entrypoint.
//!
//! Usage:
//!   keel start --config config/keel.toml
//!   keel config validate --config config/keel.toml
//!   keel config show --format json

use anyhow::Result;
use clap::Parser;
use keel::cli::commands::{run_config, run_start};
use keel::cli::{Cli, Commands};
use keel::core::config::ConfigOverrides;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.map(PathBuf::from);
    let overrides = ConfigOverrides {
        log_level: cli.log_level,
        base_path: None,
    };

    match cli.command {
        Commands::Start(args) => run_start(args, config_path.as_deref(), overrides).await,
        Commands::Config(args) => run_config(args, config_path.as_deref()),
    }
}
