//! Payload codecs.
//!
//! A codec turns wire bytes into a [`Record`] and back. Records are ordered
//! maps, so encoding is deterministic: keys are always written sorted.

use crate::message::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encode/decode contract for one wire format.
pub trait PayloadCodec: Send + Sync {
    /// Decode wire bytes into a record.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are malformed or not a map.
    fn decode(&self, payload: &[u8]) -> Result<Record, CodecError>;

    /// Encode a record into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be represented in this format.
    fn encode(&self, record: &Record) -> Result<Vec<u8>, CodecError>;
}

/// Codec selector as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    /// JSON object
    #[default]
    Json,
    /// CBOR map
    Cbor,
}

impl CodecType {
    /// The codec implementation for this selector.
    #[must_use]
    pub fn codec(self) -> &'static dyn PayloadCodec {
        match self {
            Self::Json => &JsonCodec,
            Self::Cbor => &CborCodec,
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        })
    }
}

/// JSON object payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn decode(&self, payload: &[u8]) -> Result<Record, CodecError> {
        match serde_json::from_slice(payload) {
            Ok(serde_json::Value::Object(record)) => Ok(record),
            Ok(other) => Err(CodecError::NotAMap(value_kind(&other))),
            Err(e) => Err(CodecError::Decode(e.to_string())),
        }
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(record).map_err(|e| CodecError::Encode(e.to_string()))
    }
}

/// CBOR map payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl PayloadCodec for CborCodec {
    fn decode(&self, payload: &[u8]) -> Result<Record, CodecError> {
        let value: serde_json::Value =
            ciborium::from_reader(payload).map_err(|e| CodecError::Decode(e.to_string()))?;
        match value {
            serde_json::Value::Object(record) => Ok(record),
            other => Err(CodecError::NotAMap(value_kind(&other))),
        }
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(bytes)
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Errors for payload encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Payload bytes could not be parsed
    #[error("decode failed: {0}")]
    Decode(String),
    /// Payload parsed but is not a map of fields
    #[error("payload is a {0}, expected a map of fields")]
    NotAMap(&'static str),
    /// Record could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}
