//! Dead-letter records for envelopes that permanently fail a stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Pipeline step that can fail an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    ApplyState,
    EvaluateAlert,
    DispatchAlert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::ApplyState => "apply_state",
            Stage::EvaluateAlert => "evaluate_alert",
            Stage::DispatchAlert => "dispatch_alert",
        };
        f.write_str(s)
    }
}

/// Written to the dead-letter sink for manual or automated replay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Stage that failed
    pub stage: Stage,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,
    pub raw_payload: Value,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(stage: Stage, reason: impl Into<String>, raw_payload: Value) -> Self {
        Self {
            stage,
            reason: reason.into(),
            entity_id: None,
            envelope_id: None,
            raw_payload,
            failed_at: Utc::now(),
        }
    }

    pub fn for_envelope(mut self, entity_id: &str, envelope_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self.envelope_id = Some(envelope_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_wire_format() {
        let letter = DeadLetter::new(
            Stage::ApplyState,
            "store unavailable",
            serde_json::json!({"customer_id": "C001", "amount": 5}),
        )
        .for_envelope("C001", "ev-1");

        let json = serde_json::to_value(&letter).unwrap();
        assert_eq!(json["stage"], "apply_state");
        assert_eq!(json["reason"], "store unavailable");
        assert_eq!(json["rawPayload"]["customer_id"], "C001");
        assert_eq!(json["envelopeId"], "ev-1");
    }
}
