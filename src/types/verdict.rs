//! Scoring verdicts produced by the scoring client

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tri-state anomaly judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyFlag {
    Anomalous,
    Normal,
    /// The collaborator could not be reached or rejected the request
    UnknownOnFailure,
}

impl AnomalyFlag {
    /// Map the collaborator's prediction label (-1 = outlier) to a flag
    pub fn from_prediction(prediction: i64) -> Self {
        if prediction == -1 {
            AnomalyFlag::Anomalous
        } else {
            AnomalyFlag::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyFlag::Anomalous => "anomalous",
            AnomalyFlag::Normal => "normal",
            AnomalyFlag::UnknownOnFailure => "unknown_on_failure",
        }
    }
}

/// The scoring collaborator's judgment for one envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub envelope_id: String,
    pub flag: AnomalyFlag,
    /// Ranking score; decisions use `flag`, not this value
    pub score: f64,
    /// Wall time spent on the collaborator, across all attempts
    #[serde(with = "duration_micros")]
    pub latency: Duration,
    pub attempts: u32,
}

impl Verdict {
    pub fn unknown(envelope_id: impl Into<String>, latency: Duration, attempts: u32) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            flag: AnomalyFlag::UnknownOnFailure,
            score: 0.0,
            latency,
            attempts,
        }
    }

    pub fn is_anomalous(&self) -> bool {
        self.flag == AnomalyFlag::Anomalous
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_from_prediction() {
        assert_eq!(AnomalyFlag::from_prediction(-1), AnomalyFlag::Anomalous);
        assert_eq!(AnomalyFlag::from_prediction(1), AnomalyFlag::Normal);
        assert_eq!(AnomalyFlag::from_prediction(0), AnomalyFlag::Normal);
        assert_eq!(AnomalyFlag::UnknownOnFailure.as_str(), "unknown_on_failure");
    }

    #[test]
    fn test_unknown_verdict() {
        let verdict = Verdict::unknown("ev-9", Duration::from_millis(20), 3);
        assert_eq!(verdict.flag, AnomalyFlag::UnknownOnFailure);
        assert!(!verdict.is_anomalous());
        assert_eq!(verdict.attempts, 3);

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["flag"], "unknown_on_failure");
        assert_eq!(json["latency"], 20_000);
    }
}
