//! Declarative bridge configuration.
//!
//! ```json
//! {
//!   "connection": {"ip": "ssl://broker.example.com", "port": 8883},
//!   "authentication": {"type": "credentials", "credentials": {"username": "u", "password": "p"}},
//!   "payloads": [{"topic": "sensors/temp", "qos": 1, "timestamp": {"field_name": "ts", "format": "s"}}],
//!   "metrics_map": [{
//!     "name": "temp", "data_type": "float32", "asset_name": "pump-1", "access": "RO",
//!     "configuration": {"topic": "sensors/temp", "mapping": [{"external": "temp", "internal": "value"}]}
//!   }]
//! }
//! ```
//!
//! Loading always validates; a configuration that fails validation never
//! reaches the bridge.

use crate::codec::CodecType;
use crate::message::MetricId;
use crate::timestamp::TimestampSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use url::Url;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEPALIVE: u64 = 60;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Broker connection
    pub connection: Connection,
    /// Broker authentication
    #[serde(default)]
    pub authentication: Option<Authentication>,
    /// Payload definitions, one per topic
    #[serde(default)]
    pub payloads: Vec<PayloadDefinition>,
    /// Metric maps
    #[serde(default)]
    pub metrics_map: Vec<MetricMap>,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Host or IP, optionally prefixed with `tcp://` or `ssl://`
    pub ip: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client identifier (generated when absent)
    #[serde(default)]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

/// Transport selected by the `ip` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plaintext TCP
    Tcp,
    /// TLS over TCP
    Tls,
}

/// Resolved broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport
    pub transport: Transport,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
}

impl Connection {
    /// Resolve the broker address from `ip` and `port`.
    ///
    /// # Errors
    ///
    /// Returns error if the scheme is unsupported or the host is missing.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        if !self.ip.contains("://") {
            if self.ip.is_empty() {
                return Err(ConfigError::InvalidAddress("missing host".to_string()));
            }
            return Ok(Endpoint {
                transport: Transport::Tcp,
                host: self.ip.clone(),
                port: self.port,
            });
        }

        let url = Url::parse(&self.ip)
            .map_err(|e| ConfigError::InvalidAddress(format!("{}: {e}", self.ip)))?;

        let transport = match url.scheme() {
            "tcp" | "mqtt" => Transport::Tcp,
            "ssl" | "tls" | "mqtts" => Transport::Tls,
            scheme => return Err(ConfigError::UnsupportedTransport(scheme.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidAddress(format!("{}: missing host", self.ip)))?;

        Ok(Endpoint {
            transport,
            host: host.to_string(),
            port: url.port().unwrap_or(self.port),
        })
    }
}

/// Broker authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authentication {
    /// Authentication type; only `credentials` is supported
    #[serde(rename = "type")]
    pub auth_type: AuthenticationType,
    /// Username and password
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Supported authentication types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationType {
    /// Username/password in the connect packet
    Credentials,
}

/// Username/password pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// MQTT quality-of-service level, written as 0, 1 or 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// At most once (0)
    #[default]
    AtMostOnce,
    /// At least once (1)
    AtLeastOnce,
    /// Exactly once (2)
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ConfigError::Parse(format!("invalid qos {other}"))),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Wire definition shared by every metric on one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadDefinition {
    /// Broker topic
    pub topic: String,
    /// Subscribe/publish quality of service
    #[serde(default)]
    pub qos: Qos,
    /// Timestamp carried in the payload
    #[serde(default)]
    pub timestamp: Option<TimestampSpec>,
    /// Wire format
    #[serde(default, alias = "type")]
    pub codec_type: CodecType,
}

/// One `external` wire field to `internal` message field rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMapping {
    /// Field name in the wire record
    pub external: String,
    /// Field name in the internal message
    pub internal: String,
}

/// Which directions a metric may flow through the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Broker to platform only
    #[default]
    RO,
    /// Platform to broker only
    WO,
    /// Both directions
    RW,
}

impl Access {
    /// Whether inbound messages may be produced for this metric.
    #[must_use]
    pub fn is_readable(self) -> bool {
        matches!(self, Self::RO | Self::RW)
    }

    /// Whether outbound messages may be published for this metric.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::WO | Self::RW)
    }
}

/// Bridge-specific part of a metric map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfiguration {
    /// Payload topic; must match a payload definition
    pub topic: String,
    /// Field renames; absent means fields pass through by name
    #[serde(default)]
    pub mapping: Option<Vec<PayloadMapping>>,
}

/// One internal metric and how it maps onto a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricMap {
    /// Metric name
    pub name: String,
    /// Metric data type
    #[serde(alias = "type")]
    pub data_type: String,
    /// Asset name
    #[serde(default)]
    pub asset_name: String,
    /// Access mode
    #[serde(default)]
    pub access: Access,
    /// Topic and mapping
    pub configuration: MetricConfiguration,
}

impl MetricMap {
    /// Identity used for outbound dispatch.
    #[must_use]
    pub fn metric_id(&self) -> MetricId {
        MetricId::new(&self.name, &self.data_type, &self.asset_name)
    }
}

impl Configuration {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is malformed or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Check cross-references and connection settings.
    ///
    /// Every problem found is reported, not only the first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] listing each problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.connection.endpoint() {
            errors.push(format!("connection.ip: {e}"));
        }

        if let Some(auth) = &self.authentication {
            if auth.auth_type == AuthenticationType::Credentials && auth.credentials.is_none() {
                errors.push("authentication: credentials required".to_string());
            }
        }

        let mut topics = HashSet::new();
        for (i, payload) in self.payloads.iter().enumerate() {
            if !topics.insert(payload.topic.as_str()) {
                errors.push(format!(
                    "payloads[{i}]: duplicate topic {:?}",
                    payload.topic
                ));
            }
        }

        for (i, metric) in self.metrics_map.iter().enumerate() {
            let topic = &metric.configuration.topic;
            if !topics.contains(topic.as_str()) {
                errors.push(format!("metrics_map[{i}]: topic {topic:?} not in payloads"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Look up the payload definition for a topic.
    #[must_use]
    pub fn payload(&self, topic: &str) -> Option<&PayloadDefinition> {
        self.payloads.iter().find(|payload| payload.topic == topic)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read configuration: {0}")]
    Io(String),
    /// Document is malformed
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// Broker address is malformed
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    /// Broker address uses an unknown scheme
    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),
    /// Cross-reference or settings check failed
    #[error("configuration validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}
