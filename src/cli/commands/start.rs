//! Start command implementation.

use super::config::load_config;
use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Kernel;
use crate::core::time::SystemClock;
use crate::store::{MemoryStore, StoreClient};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

/// Start a kernel over the embedded store.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override `kernel.base_path`.
    #[arg(long)]
    pub base_path: Option<String>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over the configured level.
#[cfg(feature = "telemetry")]
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_config: &Config) {}

/// Run the start command.
pub async fn run_start(
    args: StartArgs,
    config_path: Option<&Path>,
    mut overrides: ConfigOverrides,
) -> Result<()> {
    if args.base_path.is_some() {
        overrides.base_path = args.base_path;
    }
    let config = load_config(config_path, &overrides)?;
    init_tracing(&config);

    let clock = Arc::new(SystemClock);
    let store = MemoryStore::with_config(&config.store, clock.clone());
    let session = store.connect().context("failed to open store session")?;
    tracing::info!(session_id = session.session_id(), "store session opened");

    let kernel = Kernel::new(config, session, clock)?;
    kernel.run().await
}
