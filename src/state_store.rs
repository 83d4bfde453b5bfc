//! Per-entity aggregate state store.
//!
//! Every entity has its own async mutex. Updates for one entity are applied
//! strictly one at a time in the order they reach the store; updates for
//! different entities never wait on each other beyond a map lookup.
//!
//! Redelivered envelopes are detected with a bounded per-entity log of
//! recently applied envelope ids. The log is persisted alongside the
//! aggregate so that dedup survives a restart.
//!
//! Persistence goes through [`AggregateRepository::upsert`], which is
//! conditional on the stored event count. If the stored row moved underneath
//! us, the update would double-count or drop an event, so the entity is
//! quarantined instead of "fixing" the numbers. The one exception is a retry
//! that conflicts with its own earlier attempt: when the stored row already
//! lists the envelope, that attempt committed and the row is adopted.
//!
//! When an [`AuditRepository`] is attached, each applied envelope is also
//! appended to the audit trail, ahead of the aggregate write.

use crate::audit::{AuditEntry, AuditRepository};
use crate::config::StoreConfig;
use crate::error::{DependencyError, StateStoreError, StoreResult};
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use crate::types::aggregate::{AggregateState, RiskTierThresholds, SpikeRule};
use crate::types::envelope::Envelope;
use crate::types::verdict::Verdict;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, warn};

/// One entry of the dedup log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEnvelope {
    pub envelope_id: String,
    /// Event time of the envelope
    pub timestamp: DateTime<Utc>,
    /// Wall-clock time the envelope was applied; retention is measured on this
    #[serde(default = "Utc::now")]
    pub applied_at: DateTime<Utc>,
}

/// What the repository stores per entity
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub state: AggregateState,
    /// Oldest first
    pub recent_envelopes: Vec<AppliedEnvelope>,
}

/// Result of a conditional upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The stored event count no longer matched the expected one
    Conflict,
}

/// Durable storage for aggregates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    async fn load(&self, entity_id: &str) -> Result<Option<AggregateRecord>, DependencyError>;

    /// Insert or update the record, but only if the stored `event_count`
    /// equals `expected_count` (0 for a row that does not exist yet).
    async fn upsert(
        &self,
        record: &AggregateRecord,
        expected_count: u64,
    ) -> Result<UpsertOutcome, DependencyError>;
}

/// Process-local repository, used when no database is configured and in tests
#[derive(Default)]
pub struct InMemoryAggregateRepository {
    rows: Mutex<HashMap<String, AggregateRecord>>,
}

impl InMemoryAggregateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<AggregateRecord> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.get(entity_id).cloned()
    }

    /// Overwrite a row directly, bypassing the conditional check
    pub fn put(&self, record: AggregateRecord) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.insert(record.state.entity_id.clone(), record);
    }
}

#[async_trait]
impl AggregateRepository for InMemoryAggregateRepository {
    async fn load(&self, entity_id: &str) -> Result<Option<AggregateRecord>, DependencyError> {
        Ok(self.get(entity_id))
    }

    async fn upsert(
        &self,
        record: &AggregateRecord,
        expected_count: u64,
    ) -> Result<UpsertOutcome, DependencyError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let stored = rows
            .get(&record.state.entity_id)
            .map(|r| r.state.event_count)
            .unwrap_or(0);
        if stored != expected_count {
            return Ok(UpsertOutcome::Conflict);
        }
        rows.insert(record.state.entity_id.clone(), record.clone());
        Ok(UpsertOutcome::Applied)
    }
}

/// Bounded, entity-scoped log of recently applied envelope ids
#[derive(Debug, Clone)]
struct RecentEnvelopes {
    order: VecDeque<AppliedEnvelope>,
    ids: HashSet<String>,
    capacity: usize,
    retention: ChronoDuration,
}

impl RecentEnvelopes {
    fn new(capacity: usize, retention: ChronoDuration) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    fn restore(entries: Vec<AppliedEnvelope>, capacity: usize, retention: ChronoDuration) -> Self {
        let mut log = Self::new(capacity, retention);
        for entry in entries {
            log.push(entry);
        }
        log
    }

    fn contains(&self, envelope_id: &str) -> bool {
        self.ids.contains(envelope_id)
    }

    fn push(&mut self, entry: AppliedEnvelope) {
        let newest = entry.applied_at;
        self.ids.insert(entry.envelope_id.clone());
        self.order.push_back(entry);

        while self.order.len() > self.capacity {
            self.evict_front();
        }
        // Event time is untrusted input; a far-future timestamp must not
        // flush the log
        while let Some(front) = self.order.front() {
            if newest - front.applied_at > self.retention {
                self.evict_front();
            } else {
                break;
            }
        }
    }

    fn evict_front(&mut self) {
        if let Some(old) = self.order.pop_front() {
            self.ids.remove(&old.envelope_id);
        }
    }

    fn to_vec(&self) -> Vec<AppliedEnvelope> {
        self.order.iter().cloned().collect()
    }
}

struct EntitySlot {
    /// False until the row has been read from the repository
    loaded: bool,
    state: AggregateState,
    recent: RecentEnvelopes,
    /// Set once a consistency violation is seen; all later updates fail fast
    quarantined: Option<String>,
}

/// Result of applying one envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Aggregate after the update (or the current one, for duplicates)
    pub state: AggregateState,
    /// Average amount before this envelope; None for first events and duplicates
    pub prior_average: Option<f64>,
    /// Number of events before this envelope
    pub prior_count: u64,
    /// The envelope id was already applied; aggregates are untouched
    pub duplicate: bool,
}

/// Serialized, idempotent, per-entity aggregate updates
pub struct StateStore {
    repository: Arc<dyn AggregateRepository>,
    audit: Option<Arc<dyn AuditRepository>>,
    retry: RetryPolicy,
    thresholds: RiskTierThresholds,
    spike_rule: SpikeRule,
    dedup_capacity: usize,
    dedup_retention: ChronoDuration,
    slots: RwLock<HashMap<String, Arc<tokio::sync::Mutex<EntitySlot>>>>,
    metrics: Arc<PipelineMetrics>,
}

impl StateStore {
    pub fn new(
        repository: Arc<dyn AggregateRepository>,
        config: &StoreConfig,
        thresholds: RiskTierThresholds,
        spike_rule: SpikeRule,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            repository,
            audit: None,
            retry: config.retry.clone(),
            thresholds,
            spike_rule,
            dedup_capacity: config.dedup_capacity,
            dedup_retention: ChronoDuration::seconds(config.dedup_retention_secs as i64),
            slots: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Record every applied envelope in `audit`
    pub fn with_audit(mut self, audit: Arc<dyn AuditRepository>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn slot(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<EntitySlot>> {
        if let Ok(slots) = self.slots.read() {
            if let Some(slot) = slots.get(entity_id) {
                return slot.clone();
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(EntitySlot {
                    loaded: false,
                    state: AggregateState::new(entity_id),
                    recent: RecentEnvelopes::new(self.dedup_capacity, self.dedup_retention),
                    quarantined: None,
                }))
            })
            .clone()
    }

    async fn load_record(&self, entity_id: &str) -> StoreResult<Option<AggregateRecord>> {
        let (record, _) = self
            .retry
            .run("aggregate_load", |_| self.repository.load(entity_id))
            .await
            .map_err(|exhausted| StateStoreError::Persistence {
                entity_id: entity_id.to_string(),
                attempts: exhausted.attempts,
                source: exhausted.error,
            })?;
        Ok(record)
    }

    async fn ensure_loaded(&self, entity_id: &str, slot: &mut EntitySlot) -> StoreResult<()> {
        if slot.loaded {
            return Ok(());
        }

        if let Some(record) = self.load_record(entity_id).await? {
            slot.state = record.state;
            slot.recent = self.restore_recent(record.recent_envelopes);
        }
        slot.loaded = true;
        Ok(())
    }

    fn restore_recent(&self, entries: Vec<AppliedEnvelope>) -> RecentEnvelopes {
        RecentEnvelopes::restore(entries, self.dedup_capacity, self.dedup_retention)
    }

    async fn append_audit(&self, envelope: &Envelope, verdict: &Verdict) -> StoreResult<()> {
        let Some(audit) = &self.audit else {
            return Ok(());
        };
        let entry = AuditEntry::new(envelope, verdict);
        self.retry
            .run("audit_append", |_| audit.append(&entry))
            .await
            .map(|_| ())
            .map_err(|exhausted| {
                error!(
                    entity_id = %envelope.entity_id,
                    envelope_id = %envelope.envelope_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Audit append failed, state left unchanged"
                );
                StateStoreError::Persistence {
                    entity_id: envelope.entity_id.clone(),
                    attempts: exhausted.attempts,
                    source: exhausted.error,
                }
            })
    }

    fn quarantine(
        &self,
        slot: &mut EntitySlot,
        envelope: &Envelope,
        expected: u64,
    ) -> StateStoreError {
        let detail = format!(
            "stored aggregate diverged from expected event_count {} while applying {}",
            expected, envelope.envelope_id
        );
        error!(
            entity_id = %envelope.entity_id,
            envelope_id = %envelope.envelope_id,
            expected_count = expected,
            "Consistency violation, quarantining entity"
        );
        PipelineMetrics::incr(&self.metrics.consistency_violations);
        slot.quarantined = Some(detail.clone());
        StateStoreError::ConsistencyViolation {
            entity_id: envelope.entity_id.clone(),
            detail,
        }
    }

    /// Apply one scored envelope to its entity's aggregate.
    ///
    /// On persistence failure the in-memory aggregate is left unchanged and
    /// no other update for the entity runs until this call returns.
    pub async fn apply_update(
        &self,
        envelope: &Envelope,
        verdict: &Verdict,
    ) -> StoreResult<ApplyOutcome> {
        let entity_id = envelope.entity_id.as_str();
        let slot = self.slot(entity_id);
        let mut slot = slot.lock().await;

        if let Some(detail) = &slot.quarantined {
            return Err(StateStoreError::ConsistencyViolation {
                entity_id: entity_id.to_string(),
                detail: detail.clone(),
            });
        }

        self.ensure_loaded(entity_id, &mut slot).await?;

        if slot.recent.contains(&envelope.envelope_id) {
            PipelineMetrics::incr(&self.metrics.duplicates_skipped);
            debug!(
                entity_id,
                envelope_id = %envelope.envelope_id,
                "Duplicate envelope, aggregate unchanged"
            );
            return Ok(ApplyOutcome {
                state: slot.state.clone(),
                prior_average: None,
                prior_count: slot.state.event_count,
                duplicate: true,
            });
        }

        self.append_audit(envelope, verdict).await?;

        let prior = slot.state.clone();
        let raise_alert =
            verdict.is_anomalous() || self.spike_rule.is_spike(envelope.amount, &prior);
        let next = prior.applied(
            envelope.amount,
            envelope.timestamp,
            raise_alert,
            &self.thresholds,
        );

        let mut recent = slot.recent.clone();
        recent.push(AppliedEnvelope {
            envelope_id: envelope.envelope_id.clone(),
            timestamp: envelope.timestamp,
            applied_at: Utc::now(),
        });
        let record = AggregateRecord {
            state: next.clone(),
            recent_envelopes: recent.to_vec(),
        };

        let upsert = self
            .retry
            .run("aggregate_upsert", |attempt| {
                if attempt > 1 {
                    warn!(entity_id, attempt, "Retrying aggregate upsert");
                }
                self.repository.upsert(&record, prior.event_count)
            })
            .await;

        let (state, recent) = match upsert {
            Ok((UpsertOutcome::Applied, _)) => (next, recent),
            Ok((UpsertOutcome::Conflict, attempts)) if attempts > 1 => {
                // An earlier attempt may have committed before its reply was lost
                let stored = match self.load_record(entity_id).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        slot.loaded = false;
                        return Err(e);
                    }
                };
                match stored {
                    Some(stored)
                        if stored
                            .recent_envelopes
                            .iter()
                            .any(|e| e.envelope_id == envelope.envelope_id) =>
                    {
                        warn!(
                            entity_id,
                            envelope_id = %envelope.envelope_id,
                            attempts,
                            "Upsert committed by an earlier attempt, adopting stored aggregate"
                        );
                        let recent = self.restore_recent(stored.recent_envelopes);
                        (stored.state, recent)
                    }
                    _ => return Err(self.quarantine(&mut slot, envelope, prior.event_count)),
                }
            }
            Ok((UpsertOutcome::Conflict, _)) => {
                return Err(self.quarantine(&mut slot, envelope, prior.event_count));
            }
            Err(exhausted) => {
                error!(
                    entity_id,
                    envelope_id = %envelope.envelope_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Aggregate persistence failed, state left unchanged"
                );
                return Err(StateStoreError::Persistence {
                    entity_id: entity_id.to_string(),
                    attempts: exhausted.attempts,
                    source: exhausted.error,
                });
            }
        };

        slot.state = state.clone();
        slot.recent = recent;
        PipelineMetrics::incr(&self.metrics.state_applied);
        debug!(
            entity_id,
            envelope_id = %envelope.envelope_id,
            total = state.total_amount,
            count = state.event_count,
            tier = %state.risk_tier,
            "Aggregate updated"
        );
        Ok(ApplyOutcome {
            state,
            prior_average: prior.average_amount(),
            prior_count: prior.event_count,
            duplicate: false,
        })
    }

    /// Current aggregate for an entity, loading it if this process has not seen it
    pub async fn snapshot(&self, entity_id: &str) -> StoreResult<Option<AggregateState>> {
        let slot = self.slot(entity_id);
        let mut slot = slot.lock().await;
        self.ensure_loaded(entity_id, &mut slot).await?;
        if slot.state.event_count == 0 {
            Ok(None)
        } else {
            Ok(Some(slot.state.clone()))
        }
    }

    pub async fn is_quarantined(&self, entity_id: &str) -> bool {
        let slot = self.slot(entity_id);
        let slot = slot.lock().await;
        slot.quarantined.is_some()
    }
}
