//! Agent configuration.

use anyhow::{Context, Result};
use mqtt_bridge_core::Configuration;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the bridge configuration document
    pub config_path: PathBuf,

    /// Capacity of each platform queue
    pub queue_capacity: usize,

    /// Delay before reconnecting after the broker stream breaks
    pub restart_delay: Duration,

    /// Override for `connection.ip`
    pub broker_ip: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./mqtt-bridge.json"),
            queue_capacity: 1024,
            restart_delay: Duration::from_secs(5),
            broker_ip: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MQTT_BRIDGE_CONFIG`: Bridge configuration path
    /// - `MQTT_BRIDGE_QUEUE_CAPACITY`: Platform queue capacity
    /// - `MQTT_BRIDGE_RESTART_DELAY_SECS`: Restart delay after a stream failure
    /// - `MQTT_BRIDGE_BROKER_IP`: Broker address override
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("MQTT_BRIDGE_CONFIG") {
            config.config_path = PathBuf::from(path);
        }

        if let Some(capacity) = lookup("MQTT_BRIDGE_QUEUE_CAPACITY") {
            config.queue_capacity = capacity
                .parse()
                .context("Invalid MQTT_BRIDGE_QUEUE_CAPACITY")?;
            anyhow::ensure!(
                config.queue_capacity > 0,
                "MQTT_BRIDGE_QUEUE_CAPACITY must be positive"
            );
        }

        if let Some(delay) = lookup("MQTT_BRIDGE_RESTART_DELAY_SECS") {
            config.restart_delay = Duration::from_secs(
                delay
                    .parse()
                    .context("Invalid MQTT_BRIDGE_RESTART_DELAY_SECS")?,
            );
        }

        config.broker_ip = lookup("MQTT_BRIDGE_BROKER_IP");

        Ok(config)
    }

    /// Load and validate the bridge configuration, applying overrides.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be loaded or fails validation.
    pub fn load_bridge(&self) -> Result<Configuration> {
        let mut bridge = Configuration::load(&self.config_path).with_context(|| {
            format!(
                "Failed to load bridge configuration from {}",
                self.config_path.display()
            )
        })?;

        if let Some(ip) = &self.broker_ip {
            bridge.connection.ip.clone_from(ip);
            bridge
                .validate()
                .context("Invalid MQTT_BRIDGE_BROKER_IP")?;
        }

        Ok(bridge)
    }
}
