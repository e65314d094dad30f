//! # MQTT Bridge Agent
//!
//! Bridges an MQTT broker and the platform message bus.
//!
//! ## Architecture
//!
//! The agent runs three concurrent loops over one broker session:
//! 1. **Reader**: broker publishes to internal messages on stdout
//! 2. **Writer**: internal messages from stdin to broker publishes
//! 3. **Supervisor**: reconnects after a broken stream, handles Ctrl+C
//!
//! Logs go to stderr so stdout carries only bus traffic.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod bus;
mod config;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Bridge;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MQTT bridge agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;
    let bridge_config = config.load_bridge()?;

    tracing::info!(
        config = %config.config_path.display(),
        broker = %bridge_config.connection.ip,
        payloads = bridge_config.payloads.len(),
        metrics = bridge_config.metrics_map.len(),
        "Configuration loaded"
    );

    let bridge = Bridge::new(config, &bridge_config)?;

    // Run bridge
    bridge.run().await?;

    Ok(())
}
