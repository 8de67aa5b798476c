//! Telemetry collection agent binary.
//!
//! # Usage
//!
//! ```text
//! otel-agent [CONFIG_PATH]
//! ```
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `CONFIG_PATH`, or `/etc/otel-agent/config.toml`
//! 3. `OTEL_EXPORTER_OTLP_*` environment variables
//! 4. Environment variables with the `OTEL_AGENT_` prefix
//!
//! Log verbosity follows `RUST_LOG`.

use anyhow::{Context, Result};
use otel_agent::{Runtime, config};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("failed to initialise tracing subscriber")?;

    let config = match std::env::args().nth(1) {
        Some(path) => config::load_from_path(&path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => config::load().context("failed to load configuration")?,
    };
    tracing::debug!(?config, "Configuration loaded");

    Runtime::new(config)
        .context("failed to register components")?
        .run()
        .await
        .context("agent runtime failed")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,otel_agent=debug,otel_agent_pipeline=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}
