//! Timestamp conversion between wire records and internal time base.
//!
//! The internal time base is a signed count of nanoseconds since UNIX epoch.
//! A [`TimestampSpec`] names the record field holding the wire value and the
//! format it is written in:
//!
//! | format    | wire value                         |
//! |-----------|------------------------------------|
//! | `s`       | seconds (integer or fractional)    |
//! | `ms`      | milliseconds                       |
//! | `ns`      | nanoseconds                        |
//! | `rfc3339` | RFC 3339 date-time string          |

use crate::message::Record;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Wire representation of a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// Seconds since epoch
    S,
    /// Milliseconds since epoch
    Ms,
    /// Nanoseconds since epoch
    Ns,
    /// RFC 3339 date-time text
    Rfc3339,
}

impl TimestampFormat {
    /// Convert a wire value to nanoseconds since epoch.
    ///
    /// # Errors
    ///
    /// Returns error if the value has the wrong shape for this format or the
    /// result does not fit the internal time base.
    pub fn to_nanos(self, value: &Value) -> Result<i64, TimestampError> {
        match self {
            Self::S => scale_number(value, NANOS_PER_SECOND),
            Self::Ms => scale_number(value, NANOS_PER_MILLI),
            Self::Ns => scale_number(value, 1),
            Self::Rfc3339 => {
                let text = value.as_str().ok_or_else(|| {
                    TimestampError::InvalidValue(format!("expected string, got {value}"))
                })?;
                DateTime::parse_from_rfc3339(text)
                    .map_err(|e| TimestampError::InvalidValue(format!("{text:?}: {e}")))?
                    .timestamp_nanos_opt()
                    .ok_or(TimestampError::OutOfRange)
            }
        }
    }

    /// Convert nanoseconds since epoch to a wire value.
    ///
    /// Numeric formats produce an integer when the instant is a whole number
    /// of units and a float otherwise.
    #[must_use]
    pub fn format_nanos(self, nanos: i64) -> Value {
        match self {
            Self::S => unscale(nanos, NANOS_PER_SECOND),
            Self::Ms => unscale(nanos, NANOS_PER_MILLI),
            Self::Ns => Value::from(nanos),
            Self::Rfc3339 => Value::String(
                DateTime::<Utc>::from_timestamp_nanos(nanos)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        }
    }
}

impl FromStr for TimestampFormat {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(Self::S),
            "ms" => Ok(Self::Ms),
            "ns" => Ok(Self::Ns),
            "rfc3339" => Ok(Self::Rfc3339),
            other => Err(TimestampError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for TimestampFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::S => "s",
            Self::Ms => "ms",
            Self::Ns => "ns",
            Self::Rfc3339 => "rfc3339",
        })
    }
}

/// Where a payload carries its timestamp and how it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSpec {
    /// Record field holding the timestamp
    pub field_name: String,
    /// Wire format of that field
    pub format: TimestampFormat,
}

impl TimestampSpec {
    /// Create a new timestamp spec.
    #[must_use]
    pub fn new(field_name: impl Into<String>, format: TimestampFormat) -> Self {
        Self {
            field_name: field_name.into(),
            format,
        }
    }

    /// Read the time of validity from a decoded record.
    ///
    /// # Errors
    ///
    /// Returns error if the field is missing or cannot be converted.
    pub fn decode(&self, record: &Record) -> Result<i64, TimestampError> {
        let value = record
            .get(&self.field_name)
            .ok_or_else(|| TimestampError::MissingField(self.field_name.clone()))?;
        self.format.to_nanos(value)
    }

    /// Produce the wire value for a time of validity.
    #[must_use]
    pub fn encode(&self, time_of_validity: i64) -> Value {
        self.format.format_nanos(time_of_validity)
    }
}

fn scale_number(value: &Value, factor: i64) -> Result<i64, TimestampError> {
    match value {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.checked_mul(factor).ok_or(TimestampError::OutOfRange)
            } else if let Some(float) = number.as_f64() {
                scale_float(float, factor)
            } else {
                Err(TimestampError::OutOfRange)
            }
        }
        Value::String(text) => {
            if let Ok(int) = text.trim().parse::<i64>() {
                int.checked_mul(factor).ok_or(TimestampError::OutOfRange)
            } else {
                let float = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| TimestampError::InvalidValue(format!("{text:?}: {e}")))?;
                scale_float(float, factor)
            }
        }
        other => Err(TimestampError::InvalidValue(format!(
            "expected number, got {other}"
        ))),
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn scale_float(value: f64, factor: i64) -> Result<i64, TimestampError> {
    // Scale whole and fractional parts separately to keep sub-unit precision.
    let whole = value.trunc();
    if !whole.is_finite() || whole < i64::MIN as f64 || whole >= i64::MAX as f64 {
        return Err(TimestampError::OutOfRange);
    }
    let fraction = ((value - whole) * factor as f64).round() as i64;
    (whole as i64)
        .checked_mul(factor)
        .and_then(|scaled| scaled.checked_add(fraction))
        .ok_or(TimestampError::OutOfRange)
}

#[allow(clippy::cast_precision_loss)]
fn unscale(nanos: i64, factor: i64) -> Value {
    if nanos % factor == 0 {
        Value::from(nanos / factor)
    } else {
        Value::from((nanos / factor) as f64 + (nanos % factor) as f64 / factor as f64)
    }
}

/// Errors that can occur converting timestamps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// Record has no such field
    #[error("timestamp field missing: {0}")]
    MissingField(String),
    /// Field value has the wrong shape for the format
    #[error("invalid timestamp value: {0}")]
    InvalidValue(String),
    /// Result does not fit in nanoseconds since epoch
    #[error("timestamp out of range")]
    OutOfRange,
    /// Unrecognized format tag
    #[error("unknown timestamp format: {0}")]
    UnknownFormat(String),
}
