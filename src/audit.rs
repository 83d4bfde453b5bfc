//! Per-envelope audit trail.
//!
//! Every envelope the state store applies is recorded with its verdict,
//! giving an ordered history per customer next to the running aggregate.
//! Appends are idempotent on the envelope id, so redelivery never writes a
//! second row.

use crate::error::DependencyError;
use crate::types::envelope::Envelope;
use crate::types::verdict::{AnomalyFlag, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

/// One applied envelope and how it was judged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub envelope_id: String,
    pub entity_id: String,
    pub amount: f64,
    pub event_time: DateTime<Utc>,
    pub category: Option<String>,
    pub flag: AnomalyFlag,
    pub score: f64,
    pub partition: u32,
    pub position: u64,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(envelope: &Envelope, verdict: &Verdict) -> Self {
        Self {
            envelope_id: envelope.envelope_id.clone(),
            entity_id: envelope.entity_id.clone(),
            amount: envelope.amount,
            event_time: envelope.timestamp,
            category: envelope.category.clone(),
            flag: verdict.flag,
            score: verdict.score,
            partition: envelope.partition,
            position: envelope.position,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only store of audit entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Record an entry; a no-op if the envelope id is already recorded
    async fn append(&self, entry: &AuditEntry) -> Result<(), DependencyError>;
}

#[derive(Default)]
struct AuditLog {
    entries: Vec<AuditEntry>,
    ids: HashSet<String>,
}

/// Process-local audit trail
#[derive(Default)]
pub struct InMemoryAuditRepository {
    log: Mutex<AuditLog>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of one entity in the order they were applied
    pub fn entries_for(&self, entity_id: &str) -> Vec<AuditEntry> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.entries
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), DependencyError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.ids.insert(entry.envelope_id.clone()) {
            log.entries.push(entry.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn envelope(id: &str, amount: f64) -> Envelope {
        Envelope {
            envelope_id: id.to_string(),
            entity_id: "C001".to_string(),
            amount,
            timestamp: "2025-07-07T17:00:00Z".parse().unwrap(),
            category: Some("Online".to_string()),
            raw: serde_json::Map::new(),
            partition: 2,
            position: 9,
        }
    }

    fn verdict(id: &str, flag: AnomalyFlag) -> Verdict {
        Verdict {
            envelope_id: id.to_string(),
            flag,
            score: -0.3,
            latency: Duration::ZERO,
            attempts: 1,
        }
    }

    #[test]
    fn test_entry_captures_envelope_and_verdict() {
        let entry = AuditEntry::new(
            &envelope("t-1", 15_000.0),
            &verdict("t-1", AnomalyFlag::Anomalous),
        );
        assert_eq!(entry.entity_id, "C001");
        assert_eq!(entry.amount, 15_000.0);
        assert_eq!(entry.flag, AnomalyFlag::Anomalous);
        assert_eq!(entry.category.as_deref(), Some("Online"));
        assert_eq!((entry.partition, entry.position), (2, 9));
    }

    #[tokio::test]
    async fn test_append_is_idempotent_and_ordered() {
        let repo = InMemoryAuditRepository::new();
        for id in ["t-1", "t-2", "t-1", "t-3"] {
            let entry = AuditEntry::new(&envelope(id, 10.0), &verdict(id, AnomalyFlag::Normal));
            repo.append(&entry).await.unwrap();
        }

        let ids: Vec<String> = repo
            .entries_for("C001")
            .into_iter()
            .map(|e| e.envelope_id)
            .collect();
        assert_eq!(ids, vec!["t-1", "t-2", "t-3"]);
        assert!(repo.entries_for("C002").is_empty());
    }
}
