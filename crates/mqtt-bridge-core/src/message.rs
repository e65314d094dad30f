//! Internal message model shared with the platform bus.
//!
//! On the bus a message is a JSON object whose `_` member is the header and
//! whose remaining members are the record body:
//!
//! ```json
//! {"_": {"name": "temp", "type": "float32", "asset_name": "pump-1", "time_of_validity": 1700000000000000000}, "value": 21.5}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A decoded wire record: field name to value, iterated in sorted key order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Message header identifying the metric a value belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Metric name
    pub name: String,
    /// Metric data type
    #[serde(rename = "type")]
    pub data_type: String,
    /// Asset the metric belongs to
    #[serde(default)]
    pub asset_name: String,
    /// Time of validity in nanoseconds since UNIX epoch, now when absent
    #[serde(default = "now_ns")]
    pub time_of_validity: i64,
}

impl Header {
    /// Composite key used for outbound dispatch.
    #[must_use]
    pub fn metric_id(&self) -> MetricId {
        MetricId::new(&self.name, &self.data_type, &self.asset_name)
    }
}

/// An internal message: header plus record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Header
    #[serde(rename = "_")]
    pub header: Header,
    /// Record body (every field except the header)
    #[serde(flatten)]
    pub fields: Record,
}

impl Message {
    /// Create a message from a header and its record body.
    #[must_use]
    pub fn new(header: Header, fields: Record) -> Self {
        Self { header, fields }
    }
}

/// Identity of one internal metric: `(name, data type, asset name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId {
    /// Metric name
    pub name: String,
    /// Metric data type
    pub data_type: String,
    /// Asset name (empty when the metric has no asset)
    pub asset_name: String,
}

impl MetricId {
    /// Create a new metric identity.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        asset_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            asset_name: asset_name.into(),
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.name, self.data_type, self.asset_name)
    }
}

/// Current wall clock time in nanoseconds since UNIX epoch.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
        })
}
