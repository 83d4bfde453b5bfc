//! Alert data structures

use crate::types::envelope::Envelope;
use crate::types::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an event qualified for an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertReason {
    /// The scoring collaborator flagged the event
    Anomalous,
    /// The amount is far above the entity's historical average
    Spike,
}

/// (entity id, time bucket) pair; at most one alert is dispatched per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub entity_id: String,
    /// Bucket index: event time in seconds divided by the bucket width
    pub bucket: i64,
}

impl DedupKey {
    pub fn new(entity_id: &str, timestamp: DateTime<Utc>, bucket_secs: i64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            bucket: timestamp.timestamp().div_euclid(bucket_secs.max(1)),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.bucket)
    }
}

/// Alert generated when a scored event qualifies.
///
/// Created once per dispatched alert; `dispatched` is set by the
/// dispatcher after its single dispatch attempt (with retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Unique alert identifier
    pub alert_id: String,

    pub entity_id: String,

    /// Envelope that triggered the alert
    pub envelope_id: String,

    /// Verdict at the time of the alert
    pub verdict: Verdict,

    pub reason: AlertReason,

    pub dedup_key: DedupKey,

    pub amount: f64,

    /// Event time of the triggering envelope
    pub timestamp: DateTime<Utc>,

    pub dispatched: bool,
}

impl AlertRecord {
    pub fn new(
        envelope: &Envelope,
        verdict: &Verdict,
        reason: AlertReason,
        dedup_key: DedupKey,
    ) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            entity_id: envelope.entity_id.clone(),
            envelope_id: envelope.envelope_id.clone(),
            verdict: verdict.clone(),
            reason,
            dedup_key,
            amount: envelope.amount,
            timestamp: envelope.timestamp,
            dispatched: false,
        }
    }

    /// Wire message for the notification sink
    pub fn to_message(&self) -> AlertMessage {
        AlertMessage {
            alert_id: self.alert_id.clone(),
            entity_id: self.entity_id.clone(),
            envelope_id: self.envelope_id.clone(),
            score: self.verdict.score,
            timestamp: self.timestamp,
            reason: self.reason,
            amount: self.amount,
        }
    }
}

/// Structured message published to the notification sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub alert_id: String,
    pub entity_id: String,
    pub envelope_id: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: AlertReason,
    pub amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::verdict::AnomalyFlag;
    use std::time::Duration;

    fn envelope() -> Envelope {
        Envelope {
            envelope_id: "ev-15000".to_string(),
            entity_id: "C001".to_string(),
            amount: 15000.0,
            timestamp: "2025-07-07T17:01:00Z".parse().unwrap(),
            category: Some("Online".to_string()),
            raw: serde_json::Map::new(),
            partition: 0,
            position: 1,
        }
    }

    #[test]
    fn test_dedup_key_buckets() {
        let t0: DateTime<Utc> = "2025-07-07T17:00:00Z".parse().unwrap();
        let t1 = t0 + chrono::Duration::seconds(299);
        let t2 = t0 + chrono::Duration::seconds(300);

        assert_eq!(DedupKey::new("C001", t0, 300), DedupKey::new("C001", t1, 300));
        assert_ne!(DedupKey::new("C001", t0, 300), DedupKey::new("C001", t2, 300));
        assert_ne!(DedupKey::new("C001", t0, 300), DedupKey::new("C002", t0, 300));
    }

    #[test]
    fn test_alert_message_serialization() {
        let envelope = envelope();
        let verdict = Verdict {
            envelope_id: envelope.envelope_id.clone(),
            flag: AnomalyFlag::Anomalous,
            score: -0.21,
            latency: Duration::from_millis(4),
            attempts: 1,
        };
        let key = DedupKey::new(&envelope.entity_id, envelope.timestamp, 300);
        let alert = AlertRecord::new(&envelope, &verdict, AlertReason::Anomalous, key);

        assert!(!alert.dispatched);

        let json = serde_json::to_value(alert.to_message()).unwrap();
        assert_eq!(json["entityId"], "C001");
        assert_eq!(json["envelopeId"], "ev-15000");
        assert_eq!(json["score"], -0.21);
        assert_eq!(json["reason"], "anomalous");
        assert!(json["timestamp"].as_str().unwrap().starts_with("2025-07-07T17:01:00"));
    }
}
