//! Bridge-level errors.

use mqtt_bridge_core::ConfigError;

/// Errors surfaced by the broker side of the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Configuration rejected before the bridge started
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Session accessed while none is established
    #[error("no active connection")]
    NotConnected,
    /// Connection stopped before the session was established
    #[error("connection stopped while connecting")]
    Stopped,
    /// Inbound message stream broke
    #[error("unable to receive messages: {0}")]
    Stream(String),
    /// Publish request failed
    #[error("publish error: {0}")]
    Publish(String),
}
