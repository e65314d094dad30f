//! # MQTT Bridge Broker
//!
//! Broker-facing half of the MQTT bridge.
//!
//! ## Components
//!
//! - [`ConnectionManager`]: owns the single broker session, connects with
//!   capped exponential backoff and subscribes to every payload topic
//! - [`Reader`]: broker stream to platform queue
//! - [`Writer`]: platform queue to broker publishes, fire-and-forget
//!
//! Both loops stop cleanly when the shutdown signal is raised. A broken
//! broker stream is the only failure the reader escalates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod connection;
pub mod error;
pub mod reader;
pub mod writer;

pub use backoff::Backoff;
pub use connection::{mqtt_options, ConnectionManager, EventStream};
pub use error::BridgeError;
pub use reader::{Inbound, InboundSource, Reader};
pub use writer::{Publish, Writer};

use tokio::sync::watch;

/// Resolve once shutdown has been requested or the signal sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
