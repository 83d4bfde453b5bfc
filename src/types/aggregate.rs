//! Per-entity aggregate state and derived risk tiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk tier derived from an entity's running total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    /// Determine the tier from a running total.
    ///
    /// A total exactly at a floor belongs to the lower tier.
    pub fn from_total(total: f64, thresholds: &RiskTierThresholds) -> Self {
        if total > thresholds.high_floor {
            RiskTier::High
        } else if total > thresholds.medium_floor {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            other => Err(format!("unknown risk tier: {other}")),
        }
    }
}

/// Configurable tier bands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskTierThresholds {
    /// Totals above this are at least Medium
    pub medium_floor: f64,
    /// Totals above this are High
    pub high_floor: f64,
}

impl Default for RiskTierThresholds {
    fn default() -> Self {
        Self {
            medium_floor: 50_000.0,
            high_floor: 100_000.0,
        }
    }
}

/// Running per-entity summary.
///
/// Only the state store mutates this; everything else sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub entity_id: String,
    pub total_amount: f64,
    pub event_count: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub risk_tier: RiskTier,
    pub open_alert: bool,
}

impl AggregateState {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            total_amount: 0.0,
            event_count: 0,
            last_seen: None,
            risk_tier: RiskTier::Low,
            open_alert: false,
        }
    }

    /// Average amount over everything applied so far
    pub fn average_amount(&self) -> Option<f64> {
        if self.event_count == 0 {
            None
        } else {
            Some(self.total_amount / self.event_count as f64)
        }
    }

    /// Produce the successor state after applying one event.
    ///
    /// The tier is recomputed from the new total rather than carried over.
    pub fn applied(
        &self,
        amount: f64,
        timestamp: DateTime<Utc>,
        raise_alert: bool,
        thresholds: &RiskTierThresholds,
    ) -> Self {
        let total_amount = self.total_amount + amount;
        let last_seen = match self.last_seen {
            Some(prev) if prev > timestamp => Some(prev),
            _ => Some(timestamp),
        };

        Self {
            entity_id: self.entity_id.clone(),
            total_amount,
            event_count: self.event_count + 1,
            last_seen,
            risk_tier: RiskTier::from_total(total_amount, thresholds),
            open_alert: self.open_alert || raise_alert,
        }
    }
}

/// Single-event spike rule: an amount far above the entity's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeRule {
    /// Trigger when amount >= multiple * prior average
    pub multiple: f64,
    /// Minimum number of prior events before the rule applies
    pub min_history: u64,
}

impl SpikeRule {
    pub fn is_spike(&self, amount: f64, prior: &AggregateState) -> bool {
        self.matches(amount, prior.event_count, prior.average_amount())
    }

    /// Same rule, from a prior event count and average
    pub fn matches(&self, amount: f64, prior_count: u64, prior_average: Option<f64>) -> bool {
        if prior_count < self.min_history {
            return false;
        }
        match prior_average {
            Some(avg) if avg > 0.0 => amount >= self.multiple * avg,
            _ => false,
        }
    }
}

impl Default for SpikeRule {
    fn default() -> Self {
        Self {
            multiple: 5.0,
            min_history: 3,
        }
    }
}
