//! Raw stream records and validated event envelopes

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// A record as delivered by the stream source, before validation.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Partition the record was read from
    pub partition: u32,
    /// Position within the partition; acking a position acks everything up to it
    pub position: u64,
    /// Opaque payload, expected to be a JSON object
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(partition: u32, position: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            position,
            payload: payload.into(),
        }
    }
}

/// A validated, pipeline-internal representation of one financial event.
///
/// Immutable once created by the validator.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Correlation id; stable across redeliveries of the same record
    pub envelope_id: String,

    /// Customer / account id, the partition key
    pub entity_id: String,

    /// Signed amount. Negative values are accepted (refunds, reversals)
    pub amount: f64,

    /// Event time
    pub timestamp: DateTime<Utc>,

    /// Merchant or category label
    pub category: Option<String>,

    /// Original record, kept for audit and dead-letter replay
    #[serde(skip)]
    pub raw: Map<String, Value>,

    #[serde(skip)]
    pub partition: u32,

    #[serde(skip)]
    pub position: u64,
}

impl Envelope {
    /// Raw payload bytes for audit / dead-letter
    pub fn raw_payload(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}
