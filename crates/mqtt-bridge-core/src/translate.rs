//! Per-message translation between wire payloads and internal messages.
//!
//! Every stage returns a result; callers decide per message whether to drop
//! and log or escalate.

use crate::codec::CodecError;
use crate::message::{now_ns, Header, Message, MetricId, Record};
use crate::routing::Target;
use crate::timestamp::TimestampError;

/// Translate a payload received on the target's topic into an internal message.
///
/// # Errors
///
/// Returns error if the metric is not readable, the payload cannot be decoded,
/// a mapped field is missing or the timestamp cannot be converted.
pub fn inbound(target: &Target, payload: &[u8]) -> Result<Message, TranslateError> {
    let metric = &target.metric;
    if !metric.access.is_readable() {
        return Err(TranslateError::NotReadable(metric.metric_id()));
    }

    let definition = &target.payload;
    let data = definition.codec_type.codec().decode(payload)?;

    let fields = match &metric.configuration.mapping {
        Some(mapping) => {
            let mut fields = Record::new();
            for entry in mapping {
                let value = data
                    .get(&entry.external)
                    .ok_or_else(|| TranslateError::MissingField(entry.external.clone()))?;
                fields.insert(entry.internal.clone(), value.clone());
            }
            fields
        }
        None => data.clone(),
    };

    let time_of_validity = match &definition.timestamp {
        Some(timestamp) => timestamp.decode(&data)?,
        None => now_ns(),
    };

    let header = Header {
        name: metric.name.clone(),
        data_type: metric.data_type.clone(),
        asset_name: metric.asset_name.clone(),
        time_of_validity,
    };

    Ok(Message::new(header, fields))
}

/// Translate an internal message into payload bytes for the target's topic.
///
/// # Errors
///
/// Returns error if the metric is not writable, a mapped field is missing or
/// the record cannot be encoded.
pub fn outbound(target: &Target, message: &Message) -> Result<Vec<u8>, TranslateError> {
    let metric = &target.metric;
    if !metric.access.is_writable() {
        return Err(TranslateError::NotWritable(metric.metric_id()));
    }

    let mut record = match &metric.configuration.mapping {
        Some(mapping) => {
            let mut record = Record::new();
            for entry in mapping {
                let value = message
                    .fields
                    .get(&entry.internal)
                    .ok_or_else(|| TranslateError::MissingField(entry.internal.clone()))?;
                record.insert(entry.external.clone(), value.clone());
            }
            record
        }
        None => message.fields.clone(),
    };

    let definition = &target.payload;
    if let Some(timestamp) = &definition.timestamp {
        record.insert(
            timestamp.field_name.clone(),
            timestamp.encode(message.header.time_of_validity),
        );
    }

    Ok(definition.codec_type.codec().encode(&record)?)
}

/// Errors translating a single message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    /// Metric access mode excludes inbound traffic
    #[error("metric {0} is not readable")]
    NotReadable(MetricId),
    /// Metric access mode excludes outbound traffic
    #[error("metric {0} is not writable")]
    NotWritable(MetricId),
    /// A mapped field is absent
    #[error("missing field {0:?}")]
    MissingField(String),
    /// Payload encoding/decoding failed
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Timestamp conversion failed
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}
