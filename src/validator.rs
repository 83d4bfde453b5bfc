//! Validation of raw stream records into envelopes.
//!
//! Records come from several upstream producers, so field names and value
//! encodings vary: amounts may arrive as numbers or numeric strings, and
//! timestamps as RFC 3339 strings, plain dates, or epoch seconds. Anything
//! that cannot be coerced is rejected with a `ValidationError`; nothing here
//! has side effects.

use crate::error::ValidationError;
use crate::types::envelope::{Envelope, RawRecord};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

const ENTITY_FIELDS: &[&str] = &["entity_id", "customer_id"];
const ID_FIELDS: &[&str] = &["envelope_id", "event_id", "transaction_id"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "date"];
const CATEGORY_FIELDS: &[&str] = &["category", "merchant"];

/// Namespace for envelope ids derived from payload bytes
const ENVELOPE_NAMESPACE: uuid::Uuid =
    uuid::Uuid::from_u128(0x6f1c_2b7e_84d3_4c4a_9a57_3e0d_51b2_c9f1);

/// Turns raw records into envelopes.
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate one raw record.
    pub fn validate(&self, raw: &RawRecord) -> Result<Envelope, ValidationError> {
        let value: Value = serde_json::from_slice(&raw.payload)
            .map_err(|e| ValidationError::invalid_payload(format!("not valid JSON: {e}")))?;

        let Value::Object(fields) = value else {
            return Err(ValidationError::invalid_payload("expected a JSON object"));
        };

        let entity_id = entity_id(&fields)?;
        let amount = amount(&fields)?;
        let timestamp = timestamp(&fields)?;
        let category = first_present(&fields, CATEGORY_FIELDS)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let envelope_id = envelope_id(&fields, &raw.payload);

        Ok(Envelope {
            envelope_id,
            entity_id,
            amount,
            timestamp,
            category,
            raw: fields,
            partition: raw.partition,
            position: raw.position,
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn first_present<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| fields.get(*name))
        .find(|v| !v.is_null())
}

fn entity_id(fields: &Map<String, Value>) -> Result<String, ValidationError> {
    match first_present(fields, ENTITY_FIELDS) {
        None => Err(ValidationError::missing("entity_id")),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::missing("entity_id")),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ValidationError::malformed(
            "entity_id",
            format!("expected a string, got {other}"),
        )),
    }
}

fn amount(fields: &Map<String, Value>) -> Result<f64, ValidationError> {
    let value = match fields.get("amount") {
        None | Some(Value::Null) => return Err(ValidationError::missing("amount")),
        Some(v) => v,
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(ValidationError::malformed("amount", format!("not finite: {v}"))),
        None => Err(ValidationError::malformed(
            "amount",
            format!("not a number: {value}"),
        )),
    }
}

fn timestamp(fields: &Map<String, Value>) -> Result<DateTime<Utc>, ValidationError> {
    let value = first_present(fields, TIMESTAMP_FIELDS)
        .ok_or(ValidationError::missing("timestamp"))?;

    match value {
        Value::String(s) => parse_timestamp_str(s.trim()).ok_or_else(|| {
            ValidationError::malformed("timestamp", format!("unparseable timestamp: {s:?}"))
        }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| {
                ValidationError::malformed("timestamp", format!("epoch seconds out of range: {n}"))
            }),
        other => Err(ValidationError::malformed(
            "timestamp",
            format!("expected a string or epoch seconds, got {other}"),
        )),
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn envelope_id(fields: &Map<String, Value>, payload: &[u8]) -> String {
    match first_present(fields, ID_FIELDS) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        // Same bytes on redelivery give the same id
        _ => uuid::Uuid::new_v5(&ENVELOPE_NAMESPACE, payload).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationErrorKind;

    fn record(json: &str) -> RawRecord {
        RawRecord::new(2, 7, json.as_bytes().to_vec())
    }

    #[test]
    fn test_validate_minimal_record() {
        let validator = Validator::new();
        let envelope = validator
            .validate(&record(
                r#"{"customer_id": "C001", "amount": 5000, "timestamp": "2025-07-07T17:00:00Z", "merchant": "Retail"}"#,
            ))
            .unwrap();

        assert_eq!(envelope.entity_id, "C001");
        assert_eq!(envelope.amount, 5000.0);
        assert_eq!(envelope.category.as_deref(), Some("Retail"));
        assert_eq!(envelope.timestamp.to_rfc3339(), "2025-07-07T17:00:00+00:00");
        assert_eq!(envelope.partition, 2);
        assert_eq!(envelope.position, 7);
    }

    #[test]
    fn test_amount_string_is_coerced() {
        let envelope = Validator::new()
            .validate(&record(
                r#"{"entity_id": "C002", "amount": " -12.50 ", "date": "2025-07-01"}"#,
            ))
            .unwrap();

        assert_eq!(envelope.amount, -12.5);
        assert_eq!(envelope.timestamp.to_rfc3339(), "2025-07-01T00:00:00+00:00");
    }

    #[test]
    fn test_epoch_timestamp() {
        let envelope = Validator::new()
            .validate(&record(r#"{"entity_id": "C002", "amount": 1, "timestamp": 1751907600}"#))
            .unwrap();
        assert_eq!(envelope.timestamp.timestamp(), 1_751_907_600);
    }

    #[test]
    fn test_non_numeric_amount_is_malformed() {
        let err = Validator::new()
            .validate(&record(
                r#"{"customer_id": "C001", "amount": "abc", "timestamp": "2025-07-07T17:00:00Z"}"#,
            ))
            .unwrap_err();

        assert_eq!(err.kind, ValidationErrorKind::MalformedField);
        assert_eq!(err.field, "amount");
    }

    #[test]
    fn test_missing_entity_id() {
        let err = Validator::new()
            .validate(&record(r#"{"amount": 1, "timestamp": "2025-07-07T17:00:00Z"}"#))
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingField);
        assert_eq!(err.field, "entity_id");

        let err = Validator::new()
            .validate(&record(
                r#"{"customer_id": "   ", "amount": 1, "timestamp": "2025-07-07T17:00:00Z"}"#,
            ))
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingField);
    }

    #[test]
    fn test_unparseable_timestamp() {
        let err = Validator::new()
            .validate(&record(r#"{"customer_id": "C001", "amount": 1, "timestamp": "yesterday"}"#))
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MalformedField);
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn test_invalid_payload() {
        let err = Validator::new().validate(&record("[1, 2, 3]")).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::InvalidPayload);

        let err = Validator::new().validate(&record("{not json")).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::InvalidPayload);
    }

    #[test]
    fn test_envelope_id_explicit_and_derived() {
        let validator = Validator::new();
        let explicit = validator
            .validate(&record(
                r#"{"transaction_id": "tx_1", "customer_id": "C1", "amount": 1, "timestamp": "2025-07-07T17:00:00Z"}"#,
            ))
            .unwrap();
        assert_eq!(explicit.envelope_id, "tx_1");

        let payload = r#"{"customer_id": "C1", "amount": 1, "timestamp": "2025-07-07T17:00:00Z"}"#;
        let first = validator.validate(&record(payload)).unwrap();
        let redelivered = validator
            .validate(&RawRecord::new(2, 99, payload.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(first.envelope_id, redelivered.envelope_id);
    }
}
