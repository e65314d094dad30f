//! # MQTT Bridge Core
//!
//! Broker-independent building blocks of the MQTT bridge.
//!
//! This crate provides:
//! - The internal message model exchanged with the platform bus
//! - The declarative bridge configuration and its validation
//! - Timestamp conversion between wire formats and nanosecond epoch integers
//! - Payload codecs (JSON, CBOR) behind a single encode/decode contract
//! - Routing tables for inbound (topic) and outbound (metric) dispatch
//! - Per-message translation in both directions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod message;
pub mod routing;
pub mod timestamp;
pub mod translate;

pub use codec::{CodecError, CodecType, PayloadCodec};
pub use config::{
    Access, Authentication, AuthenticationType, ConfigError, Configuration, Connection,
    Credentials, Endpoint, MetricConfiguration, MetricMap, PayloadDefinition, PayloadMapping, Qos,
    Transport,
};
pub use message::{now_ns, Header, Message, MetricId, Record};
pub use routing::{RoutingTables, Target};
pub use timestamp::{TimestampError, TimestampFormat, TimestampSpec};
pub use translate::TranslateError;
