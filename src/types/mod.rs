//! Type definitions for the anomaly pipeline

pub mod aggregate;
pub mod alert;
pub mod dead_letter;
pub mod envelope;
pub mod verdict;

pub use aggregate::{AggregateState, RiskTier, RiskTierThresholds, SpikeRule};
pub use alert::{AlertMessage, AlertReason, AlertRecord, DedupKey};
pub use dead_letter::{DeadLetter, Stage};
pub use envelope::{Envelope, RawRecord};
pub use verdict::{AnomalyFlag, Verdict};
