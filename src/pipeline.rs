//! Pipeline orchestration.
//!
//! One worker task per partition pulls a batch, validates it in order,
//! splits it into per-entity groups and runs the groups concurrently. Each
//! envelope walks the stages
//!
//! ```text
//! Received -> Validated -> Scored -> StateApplied -> AlertEvaluated -> Done
//! ```
//!
//! or ends in `Failed { stage, reason }` after being dead-lettered. A worker
//! fetches its next batch only once the current one is finished. Envelopes
//! of one entity never run concurrently, and in-flight envelopes across all
//! partitions are bounded by a shared semaphore.
//!
//! Acks follow a per-partition ledger: the worker acks the highest position
//! below which every record is finished. A record whose dead letter could
//! not be delivered stays unfinished across batches, holding the ack back,
//! and its dead letter is retried until it goes through.

use crate::alert_router::{AlertDecision, AlertDispatcher, AlertRouter};
use crate::config::PipelineConfig;
use crate::metrics::PipelineMetrics;
use crate::scoring::ScoringClient;
use crate::sink::DeadLetterSink;
use crate::source::StreamSource;
use crate::state_store::StateStore;
use crate::types::dead_letter::{DeadLetter, Stage};
use crate::types::envelope::{Envelope, RawRecord};
use crate::validator::Validator;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Where an envelope is in its processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeState {
    Received,
    Validated,
    Scored,
    StateApplied,
    AlertEvaluated,
    Done,
    Failed { stage: Stage, reason: String },
}

impl EnvelopeState {
    /// Successor on the happy path; None for terminal states
    pub fn next(&self) -> Option<EnvelopeState> {
        match self {
            EnvelopeState::Received => Some(EnvelopeState::Validated),
            EnvelopeState::Validated => Some(EnvelopeState::Scored),
            EnvelopeState::Scored => Some(EnvelopeState::StateApplied),
            EnvelopeState::StateApplied => Some(EnvelopeState::AlertEvaluated),
            EnvelopeState::AlertEvaluated => Some(EnvelopeState::Done),
            EnvelopeState::Done | EnvelopeState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    fn advance(&mut self) {
        if let Some(next) = self.next() {
            trace!(from = ?self, to = ?next, "Envelope state");
            *self = next;
        }
    }

    fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        *self = EnvelopeState::Failed {
            stage,
            reason: reason.into(),
        };
    }
}

/// How a record of a batch ended
#[derive(Debug)]
enum Settled {
    /// Processed, or rejected and dead-lettered
    Finished,
    /// Its dead letter could not be delivered yet
    Held(DeadLetter),
    /// Skipped on cancellation; replayed after a restart
    Abandoned,
}

/// Ack bookkeeping for one partition, carried across batches
#[derive(Debug, Default)]
struct AckLedger {
    /// Highest position handed to the pipeline
    highest: u64,
    /// Positions that are not finished. `Some` holds a dead letter still
    /// to be delivered, `None` an abandoned record.
    unfinished: BTreeMap<u64, Option<DeadLetter>>,
    /// Last position acknowledged to the source
    acked: u64,
}

impl AckLedger {
    fn record(&mut self, position: u64, settled: Settled) {
        self.highest = self.highest.max(position);
        match settled {
            Settled::Finished => {}
            Settled::Held(letter) => {
                self.unfinished.insert(position, Some(letter));
            }
            Settled::Abandoned => {
                self.unfinished.insert(position, None);
            }
        }
    }

    /// Dead letters waiting for redelivery, oldest first
    fn held(&self) -> Vec<(u64, DeadLetter)> {
        self.unfinished
            .iter()
            .filter_map(|(position, letter)| letter.clone().map(|l| (*position, l)))
            .collect()
    }

    /// Highest position such that it and everything before it are finished,
    /// if that moves past what was already acked
    fn ack_position(&self) -> Option<u64> {
        let limit = match self.unfinished.keys().next() {
            Some(first) => self.highest.min(first.saturating_sub(1)),
            None => self.highest,
        };
        (limit > self.acked).then_some(limit)
    }
}

/// Collaborators the pipeline is assembled from
pub struct PipelineComponents {
    pub source: Arc<dyn StreamSource>,
    pub scoring: ScoringClient,
    pub store: StateStore,
    pub router: AlertRouter,
    pub dispatcher: Arc<AlertDispatcher>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

pub struct Pipeline {
    source: Arc<dyn StreamSource>,
    validator: Validator,
    scoring: ScoringClient,
    store: StateStore,
    router: AlertRouter,
    dispatcher: Arc<AlertDispatcher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ledgers: Mutex<HashMap<u32, AckLedger>>,
    permits: Semaphore,
    idle_backoff: Duration,
    error_backoff: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        components: PipelineComponents,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            source: components.source,
            validator: Validator::new(),
            scoring: components.scoring,
            store: components.store,
            router: components.router,
            dispatcher: components.dispatcher,
            dead_letters: components.dead_letters,
            ledgers: Mutex::new(HashMap::new()),
            permits: Semaphore::new(config.workers.max(1)),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            metrics,
        }
    }

    /// Run every partition worker until `ctx` is cancelled.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        let partitions = self.source.partitions();
        info!(partitions = partitions.len(), "Starting partition workers");

        let workers: Vec<_> = partitions
            .into_iter()
            .map(|partition| tokio::spawn(self.clone().run_partition(partition, ctx.clone())))
            .collect();

        for (i, result) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!(worker = i, error = %e, "Partition worker panicked");
            }
        }

        info!(
            abandoned_envelopes = PipelineMetrics::get(&self.metrics.envelopes_abandoned),
            completed = PipelineMetrics::get(&self.metrics.envelopes_completed),
            "Pipeline stopped"
        );
    }

    async fn run_partition(self: Arc<Self>, partition: u32, ctx: CancellationToken) {
        debug!(partition, "Partition worker started");

        loop {
            let batch = tokio::select! {
                _ = ctx.cancelled() => break,
                batch = self.source.next_batch(partition) => batch,
            };

            match batch {
                Ok(records) if records.is_empty() => {
                    self.settle(partition).await;
                    if pause(&ctx, self.idle_backoff).await {
                        break;
                    }
                }
                Ok(records) => self.process_batch(partition, records, &ctx).await,
                Err(e) => {
                    error!(partition, error = %e, "Failed to fetch batch");
                    if pause(&ctx, self.error_backoff).await {
                        break;
                    }
                }
            }
        }

        debug!(partition, "Partition worker stopped");
    }

    /// Process one batch to completion, then ack what can be acked
    pub async fn process_batch(
        &self,
        partition: u32,
        records: Vec<RawRecord>,
        ctx: &CancellationToken,
    ) {
        self.redeliver_held(partition).await;
        self.metrics.add_received(records.len() as u64);

        let mut settled: Vec<(u64, Settled)> = Vec::with_capacity(records.len());
        let mut groups: Vec<Vec<Envelope>> = Vec::new();
        let mut group_of: HashMap<String, usize> = HashMap::new();

        for record in records {
            match self.validator.validate(&record) {
                Ok(envelope) => {
                    let entity_id = envelope.entity_id.clone();
                    let index = *group_of.entry(entity_id).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[index].push(envelope);
                }
                Err(e) => {
                    warn!(
                        partition,
                        position = record.position,
                        kind = %e.kind,
                        field = e.field,
                        error = %e,
                        "Rejected record"
                    );
                    self.metrics.record_rejection(&e.kind.to_string());
                    let letter =
                        DeadLetter::new(Stage::Validate, e.to_string(), payload_value(&record));
                    settled.push((record.position, self.dead_letter(letter).await));
                }
            }
        }

        let groups = groups.into_iter().map(|group| self.process_entity(group, ctx));
        settled.extend(join_all(groups).await.into_iter().flatten());

        {
            let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
            let ledger = ledgers.entry(partition).or_default();
            for (position, outcome) in settled {
                ledger.record(position, outcome);
            }
        }
        self.ack(partition).await;
    }

    /// Retry held dead letters and ack whatever that unblocks
    async fn settle(&self, partition: u32) {
        self.redeliver_held(partition).await;
        self.ack(partition).await;
    }

    async fn redeliver_held(&self, partition: u32) {
        let held = {
            let ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
            match ledgers.get(&partition) {
                Some(ledger) => ledger.held(),
                None => return,
            }
        };

        for (position, letter) in held {
            if let Settled::Held(_) = self.dead_letter(letter).await {
                // Keep order: nothing later can be acked before this one anyway
                break;
            }
            info!(partition, position, "Held dead letter delivered");
            let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ledger) = ledgers.get_mut(&partition) {
                ledger.unfinished.remove(&position);
            }
        }
    }

    async fn ack(&self, partition: u32) {
        let position = {
            let ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
            ledgers.get(&partition).and_then(AckLedger::ack_position)
        };
        let Some(position) = position else {
            return;
        };

        match self.source.ack(partition, position).await {
            Ok(()) => {
                let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(ledger) = ledgers.get_mut(&partition) {
                    ledger.acked = ledger.acked.max(position);
                }
            }
            Err(e) => error!(partition, position, error = %e, "Failed to ack"),
        }
    }

    /// Envelopes of one entity, strictly in arrival order
    async fn process_entity(
        &self,
        envelopes: Vec<Envelope>,
        ctx: &CancellationToken,
    ) -> Vec<(u64, Settled)> {
        let mut results = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            let position = envelope.position;
            if ctx.is_cancelled() {
                self.metrics.add_abandoned(1);
                results.push((position, Settled::Abandoned));
                continue;
            }

            let permit = tokio::select! {
                _ = ctx.cancelled() => None,
                permit = self.permits.acquire() => permit.ok(),
            };
            let Some(_permit) = permit else {
                self.metrics.add_abandoned(1);
                results.push((position, Settled::Abandoned));
                continue;
            };

            let span = info_span!(
                "envelope",
                envelope_id = %envelope.envelope_id,
                entity_id = %envelope.entity_id,
                partition = envelope.partition,
                position
            );
            let (state, settled) = self.process_envelope(envelope).instrument(span).await;
            debug_assert!(state.is_terminal());
            results.push((position, settled));
        }

        results
    }

    /// Drive one validated envelope to a terminal state
    async fn process_envelope(&self, envelope: Envelope) -> (EnvelopeState, Settled) {
        let started = Instant::now();
        let mut state = EnvelopeState::Validated;

        let verdict = self.scoring.score(&envelope).await;
        state.advance();

        let outcome = match self.store.apply_update(&envelope, &verdict).await {
            Ok(outcome) => outcome,
            Err(e) => {
                state.fail(Stage::ApplyState, e.to_string());
                let letter =
                    DeadLetter::new(Stage::ApplyState, e.to_string(), envelope.raw_payload())
                        .for_envelope(&envelope.entity_id, &envelope.envelope_id);
                return (state, self.dead_letter(letter).await);
            }
        };
        state.advance();

        match self.router.evaluate(&envelope, &verdict, &outcome) {
            AlertDecision::Dispatch(alert) => {
                debug!(alert_id = %alert.alert_id, reason = ?alert.reason, "Alert raised");
                self.dispatcher.enqueue(alert);
            }
            AlertDecision::Suppressed { dedup_key } => {
                debug!(dedup_key = %dedup_key, "Alert suppressed");
            }
            AlertDecision::NoAlert => {}
        }
        state.advance();
        // Nothing left to do once the alert decision is made
        state.advance();

        self.metrics.record_completed(started.elapsed());
        debug!(
            flag = ?verdict.flag,
            duplicate = outcome.duplicate,
            total = outcome.state.total_amount,
            tier = %outcome.state.risk_tier,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Envelope done"
        );
        (state, Settled::Finished)
    }

    /// Finished once the dead letter is durable, held otherwise
    async fn dead_letter(&self, letter: DeadLetter) -> Settled {
        match self.dead_letters.send(&letter).await {
            Ok(()) => {
                PipelineMetrics::incr(&self.metrics.dead_lettered);
                Settled::Finished
            }
            Err(e) => {
                error!(
                    stage = %letter.stage,
                    reason = %letter.reason,
                    error = %e,
                    "Failed to dead-letter, record left unacked"
                );
                Settled::Held(letter)
            }
        }
    }
}

/// Sleep unless cancelled first; returns true when cancelled
async fn pause(ctx: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn payload_value(record: &RawRecord) -> Value {
    serde_json::from_slice(&record.payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&record.payload).into_owned()))
}
