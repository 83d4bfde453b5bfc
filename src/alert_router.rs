//! Alert routing: decide whether a scored, applied envelope raises an alert,
//! suppress repeats within a time bucket, and dispatch the rest in the
//! background so that slow notification delivery never holds up state
//! progress.

use crate::config::AlertsConfig;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use crate::sink::{DeadLetterSink, NotificationSink};
use crate::state_store::ApplyOutcome;
use crate::types::alert::{AlertReason, AlertRecord, DedupKey};
use crate::types::aggregate::SpikeRule;
use crate::types::dead_letter::{DeadLetter, Stage};
use crate::types::envelope::Envelope;
use crate::types::verdict::Verdict;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of evaluating one envelope
#[derive(Debug, Clone)]
pub enum AlertDecision {
    NoAlert,
    Dispatch(AlertRecord),
    /// An alert was already dispatched for this key
    Suppressed { dedup_key: DedupKey },
}

/// Bookkeeping for one dispatched dedup key
#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub alert_id: String,
    pub last_envelope_id: String,
    pub last_seen: DateTime<Utc>,
    /// Qualifying events seen for this key, including the dispatched one
    pub occurrences: u64,
}

/// Dedup entries per entity, keyed by bucket. Pruning is relative to each
/// entity's own newest bucket, so a lagging partition keeps its entries.
type DedupTable = HashMap<String, BTreeMap<i64, DedupEntry>>;

/// Decides whether an envelope raises an alert
pub struct AlertRouter {
    bucket_secs: i64,
    retained_buckets: i64,
    spike_rule: SpikeRule,
    table: Mutex<DedupTable>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertRouter {
    pub fn new(config: &AlertsConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            bucket_secs: config.bucket_secs.max(1),
            retained_buckets: config.retained_buckets.max(1),
            spike_rule: config.spike.clone(),
            table: Mutex::new(DedupTable::new()),
            metrics,
        }
    }

    fn reason(
        &self,
        envelope: &Envelope,
        verdict: &Verdict,
        outcome: &ApplyOutcome,
    ) -> Option<AlertReason> {
        if verdict.is_anomalous() {
            return Some(AlertReason::Anomalous);
        }
        // A redelivered envelope has no prior snapshot to compare against
        if !outcome.duplicate
            && self
                .spike_rule
                .matches(envelope.amount, outcome.prior_count, outcome.prior_average)
        {
            return Some(AlertReason::Spike);
        }
        None
    }

    /// Evaluate one envelope against its post-update aggregate
    pub fn evaluate(
        &self,
        envelope: &Envelope,
        verdict: &Verdict,
        outcome: &ApplyOutcome,
    ) -> AlertDecision {
        let Some(reason) = self.reason(envelope, verdict, outcome) else {
            return AlertDecision::NoAlert;
        };

        let key = DedupKey::new(&envelope.entity_id, envelope.timestamp, self.bucket_secs);
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let buckets = table.entry(key.entity_id.clone()).or_default();

        if let Some(entry) = buckets.get_mut(&key.bucket) {
            entry.last_envelope_id = envelope.envelope_id.clone();
            if envelope.timestamp > entry.last_seen {
                entry.last_seen = envelope.timestamp;
            }
            entry.occurrences += 1;
            PipelineMetrics::incr(&self.metrics.alerts_suppressed);
            debug!(
                dedup_key = %key,
                envelope_id = %envelope.envelope_id,
                occurrences = entry.occurrences,
                "Alert suppressed"
            );
            return AlertDecision::Suppressed { dedup_key: key };
        }

        let alert = AlertRecord::new(envelope, verdict, reason, key.clone());
        let newest = buckets.keys().next_back().copied();
        buckets.insert(
            key.bucket,
            DedupEntry {
                alert_id: alert.alert_id.clone(),
                last_envelope_id: envelope.envelope_id.clone(),
                last_seen: envelope.timestamp,
                occurrences: 1,
            },
        );

        if newest.map_or(true, |newest| key.bucket > newest) {
            let horizon = key.bucket - self.retained_buckets;
            *buckets = buckets.split_off(&horizon);
        }

        AlertDecision::Dispatch(alert)
    }

    /// Dedup bookkeeping for a key, if it is still retained
    pub fn entry(&self, key: &DedupKey) -> Option<DedupEntry> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(&key.entity_id)?.get(&key.bucket).cloned()
    }
}

/// Background alert delivery.
///
/// `enqueue` never waits: when the queue is full the alert is handed to the
/// dead-letter sink from a separate task. The worker task stops on cancellation, leaving
/// queued alerts undelivered, or when every handle has been dropped, after
/// delivering everything still queued.
pub struct AlertDispatcher {
    tx: mpsc::Sender<AlertRecord>,
    dead_letters: Arc<dyn DeadLetterSink>,
    outstanding: Arc<AtomicUsize>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertDispatcher {
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: &AlertsConfig,
        metrics: Arc<PipelineMetrics>,
        ctx: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let outstanding = Arc::new(AtomicUsize::new(0));

        let worker = DispatchWorker {
            rx,
            sink,
            dead_letters: dead_letters.clone(),
            retry: config.retry.clone(),
            outstanding: outstanding.clone(),
            metrics: metrics.clone(),
        };
        let handle = tokio::spawn(worker.run(ctx));

        (
            Self {
                tx,
                dead_letters,
                outstanding,
                metrics,
            },
            handle,
        )
    }

    /// Hand an alert to the background worker.
    ///
    /// Must be called from within the tokio runtime.
    pub fn enqueue(&self, alert: AlertRecord) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                warn!(alert_id = %alert.alert_id, entity_id = %alert.entity_id, "Alert queue full");
                PipelineMetrics::incr(&self.metrics.alert_dispatch_failures);
                let dead_letters = self.dead_letters.clone();
                tokio::spawn(async move {
                    dead_letter_alert(
                        dead_letters.as_ref(),
                        &alert,
                        Stage::EvaluateAlert,
                        "alert queue full",
                    )
                    .await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                PipelineMetrics::incr(&self.metrics.alerts_abandoned);
                debug!(alert_id = %alert.alert_id, "Dispatcher stopped, alert abandoned");
            }
        }
    }

    /// Alerts enqueued but not yet delivered, dead-lettered, or abandoned
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

struct DispatchWorker {
    rx: mpsc::Receiver<AlertRecord>,
    sink: Arc<dyn NotificationSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    outstanding: Arc<AtomicUsize>,
    metrics: Arc<PipelineMetrics>,
}

impl DispatchWorker {
    async fn run(mut self, ctx: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(alert) => {
                        self.deliver(alert).await;
                        self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        debug!("Alert dispatcher drained");
                        return;
                    }
                },
            }
        }

        self.rx.close();
        let mut abandoned = 0u64;
        while self.rx.try_recv().is_ok() {
            abandoned += 1;
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        self.metrics.alerts_abandoned.fetch_add(abandoned, Ordering::Relaxed);
        info!(abandoned_alerts = abandoned, "Alert dispatcher stopped");
    }

    async fn deliver(&self, mut alert: AlertRecord) {
        let message = alert.to_message();
        let result = self
            .retry
            .run("notification_sink", |_| self.sink.publish(&message))
            .await;

        match result {
            Ok((_, attempts)) => {
                alert.dispatched = true;
                PipelineMetrics::incr(&self.metrics.alerts_dispatched);
                info!(
                    alert_id = %alert.alert_id,
                    entity_id = %alert.entity_id,
                    envelope_id = %alert.envelope_id,
                    reason = ?alert.reason,
                    attempts,
                    "Alert dispatched"
                );
            }
            Err(exhausted) => {
                PipelineMetrics::incr(&self.metrics.alert_dispatch_failures);
                error!(
                    alert_id = %alert.alert_id,
                    entity_id = %alert.entity_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Alert dispatch failed"
                );
                dead_letter_alert(
                    self.dead_letters.as_ref(),
                    &alert,
                    Stage::DispatchAlert,
                    &exhausted.error.to_string(),
                )
                .await;
            }
        }
    }
}

async fn dead_letter_alert(
    sink: &dyn DeadLetterSink,
    alert: &AlertRecord,
    stage: Stage,
    reason: &str,
) {
    let payload = serde_json::to_value(alert).unwrap_or(serde_json::Value::Null);
    let letter = DeadLetter::new(stage, reason, payload)
        .for_envelope(&alert.entity_id, &alert.envelope_id);
    if let Err(e) = sink.send(&letter).await {
        error!(
            alert_id = %alert.alert_id,
            error = %e,
            "Failed to dead-letter alert"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DependencyError;
    use crate::sink::{MemorySink, MockDeadLetterSink, MockNotificationSink};
    use crate::types::aggregate::AggregateState;
    use crate::types::alert::AlertMessage;
    use crate::types::verdict::AnomalyFlag;
    use std::time::Duration;

    fn envelope(id: &str, amount: f64, at: &str) -> Envelope {
        envelope_for("C001", id, amount, at)
    }

    fn envelope_for(entity: &str, id: &str, amount: f64, at: &str) -> Envelope {
        Envelope {
            envelope_id: id.to_string(),
            entity_id: entity.to_string(),
            amount,
            timestamp: at.parse().unwrap(),
            category: None,
            raw: serde_json::Map::new(),
            partition: 0,
            position: 0,
        }
    }

    fn verdict(id: &str, flag: AnomalyFlag) -> Verdict {
        Verdict {
            envelope_id: id.to_string(),
            flag,
            score: -0.2,
            latency: Duration::ZERO,
            attempts: 1,
        }
    }

    fn outcome(prior_count: u64, prior_average: Option<f64>) -> ApplyOutcome {
        ApplyOutcome {
            state: AggregateState::new("C001"),
            prior_average,
            prior_count,
            duplicate: false,
        }
    }

    fn router() -> AlertRouter {
        AlertRouter::new(&AlertsConfig::default(), Arc::new(PipelineMetrics::new()))
    }

    fn config() -> AlertsConfig {
        AlertsConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..AlertsConfig::default()
        }
    }

    #[test]
    fn test_normal_verdict_without_spike_is_no_alert() {
        let router = router();
        let ev = envelope("ev-1", 200.0, "2025-07-07T17:00:00Z");
        let normal = verdict("ev-1", AnomalyFlag::Normal);
        let decision = router.evaluate(&ev, &normal, &outcome(5, Some(100.0)));
        assert!(matches!(decision, AlertDecision::NoAlert));
    }

    #[test]
    fn test_unknown_verdict_is_not_an_alert() {
        let router = router();
        let ev = envelope("ev-1", 200.0, "2025-07-07T17:00:00Z");
        let decision = router.evaluate(
            &ev,
            &verdict("ev-1", AnomalyFlag::UnknownOnFailure),
            &outcome(0, None),
        );
        assert!(matches!(decision, AlertDecision::NoAlert));
    }

    #[test]
    fn test_spike_needs_history() {
        let router = router();
        let ev = envelope("ev-1", 5_000.0, "2025-07-07T17:00:00Z");
        let normal = verdict("ev-1", AnomalyFlag::Normal);

        let decision = router.evaluate(&ev, &normal, &outcome(2, Some(100.0)));
        assert!(matches!(decision, AlertDecision::NoAlert));

        match router.evaluate(&ev, &normal, &outcome(3, Some(100.0))) {
            AlertDecision::Dispatch(alert) => assert_eq!(alert.reason, AlertReason::Spike),
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_one_alert_per_bucket() {
        let router = router();
        let mut dispatched = 0;
        let mut suppressed = 0;

        for i in 0..10 {
            let id = format!("ev-{i}");
            let ev = envelope(&id, 900.0, &format!("2025-07-07T17:00:{:02}Z", i * 5));
            match router.evaluate(&ev, &verdict(&id, AnomalyFlag::Anomalous), &outcome(i, None)) {
                AlertDecision::Dispatch(_) => dispatched += 1,
                AlertDecision::Suppressed { .. } => suppressed += 1,
                AlertDecision::NoAlert => panic!("anomalous verdict must qualify"),
            }
        }
        assert_eq!(dispatched, 1);
        assert_eq!(suppressed, 9);

        let key = DedupKey::new("C001", "2025-07-07T17:00:00Z".parse().unwrap(), 300);
        let entry = router.entry(&key).unwrap();
        assert_eq!(entry.occurrences, 10);
        assert_eq!(entry.last_envelope_id, "ev-9");

        let next = envelope("ev-10", 900.0, "2025-07-07T17:05:00Z");
        let anomalous = verdict("ev-10", AnomalyFlag::Anomalous);
        let decision = router.evaluate(&next, &anomalous, &outcome(10, None));
        assert!(matches!(decision, AlertDecision::Dispatch(_)));
    }

    #[test]
    fn test_old_buckets_are_pruned() {
        let router = router();
        let first = envelope("ev-1", 1.0, "2025-07-07T00:00:00Z");
        router.evaluate(&first, &verdict("ev-1", AnomalyFlag::Anomalous), &outcome(0, None));

        let much_later = envelope("ev-2", 1.0, "2025-07-08T00:00:00Z");
        router.evaluate(&much_later, &verdict("ev-2", AnomalyFlag::Anomalous), &outcome(1, None));

        let old_key = DedupKey::new("C001", first.timestamp, 300);
        assert!(router.entry(&old_key).is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_queued_alerts() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let (dispatcher, handle) = AlertDispatcher::spawn(
            sink.clone(),
            sink.clone(),
            &config(),
            metrics.clone(),
            CancellationToken::new(),
        );

        let ev = envelope("ev-1", 15_000.0, "2025-07-07T17:00:00Z");
        let v = verdict("ev-1", AnomalyFlag::Anomalous);
        let key = DedupKey::new("C001", ev.timestamp, 300);
        dispatcher.enqueue(AlertRecord::new(&ev, &v, AlertReason::Anomalous, key));

        drop(dispatcher);
        handle.await.unwrap();

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].envelope_id, "ev-1");
        assert_eq!(PipelineMetrics::get(&metrics.alerts_dispatched), 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_dead_lettered() {
        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .times(2)
            .returning(|_| Err(DependencyError::transient("broker down")));

        let mut dead_letters = MockDeadLetterSink::new();
        dead_letters
            .expect_send()
            .withf(|letter: &DeadLetter| {
                letter.stage == Stage::DispatchAlert
                    && letter.envelope_id.as_deref() == Some("ev-1")
            })
            .times(1)
            .returning(|_| Ok(()));

        let metrics = Arc::new(PipelineMetrics::new());
        let (dispatcher, handle) = AlertDispatcher::spawn(
            Arc::new(sink),
            Arc::new(dead_letters),
            &config(),
            metrics.clone(),
            CancellationToken::new(),
        );

        let ev = envelope("ev-1", 15_000.0, "2025-07-07T17:00:00Z");
        let v = verdict("ev-1", AnomalyFlag::Anomalous);
        let key = DedupKey::new("C001", ev.timestamp, 300);
        dispatcher.enqueue(AlertRecord::new(&ev, &v, AlertReason::Anomalous, key));
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(PipelineMetrics::get(&metrics.alert_dispatch_failures), 1);
        assert_eq!(PipelineMetrics::get(&metrics.alerts_dispatched), 0);
    }

    #[tokio::test]
    async fn test_cancellation_abandons_queued_alerts() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let ctx = CancellationToken::new();
        ctx.cancel();

        let (dispatcher, handle) =
            AlertDispatcher::spawn(sink.clone(), sink.clone(), &config(), metrics.clone(), ctx);

        let ev = envelope("ev-1", 15_000.0, "2025-07-07T17:00:00Z");
        let v = verdict("ev-1", AnomalyFlag::Anomalous);
        for _ in 0..3 {
            let key = DedupKey::new("C001", ev.timestamp, 300);
            dispatcher.enqueue(AlertRecord::new(&ev, &v, AlertReason::Anomalous, key));
        }
        handle.await.unwrap();

        assert!(sink.alerts().is_empty());
        assert_eq!(PipelineMetrics::get(&metrics.alerts_abandoned), 3);
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[test]
    fn test_pruning_is_per_entity() {
        let router = router();
        let anomalous = |id: &str| verdict(id, AnomalyFlag::Anomalous);

        let a1 = envelope_for("A", "a-1", 1.0, "2025-07-07T00:00:00Z");
        assert!(matches!(
            router.evaluate(&a1, &anomalous("a-1"), &outcome(0, None)),
            AlertDecision::Dispatch(_)
        ));

        // Another partition runs two hours ahead in event time
        let b1 = envelope_for("B", "b-1", 1.0, "2025-07-07T02:00:00Z");
        router.evaluate(&b1, &anomalous("b-1"), &outcome(0, None));

        let a2 = envelope_for("A", "a-2", 1.0, "2025-07-07T00:01:00Z");
        assert!(matches!(
            router.evaluate(&a2, &anomalous("a-2"), &outcome(1, None)),
            AlertDecision::Suppressed { .. }
        ));
        assert_eq!(router.entry(&DedupKey::new("A", a1.timestamp, 300)).unwrap().occurrences, 2);
    }

    /// Notification sink that never completes
    struct StalledSink;

    #[async_trait::async_trait]
    impl NotificationSink for StalledSink {
        async fn publish(&self, _message: &AlertMessage) -> Result<(), DependencyError> {
            std::future::pending().await
        }
    }

    /// Dead-letter sink that counts sends and then never completes
    #[derive(Default)]
    struct StalledDeadLetters {
        received: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DeadLetterSink for StalledDeadLetters {
        async fn send(&self, letter: &DeadLetter) -> Result<(), DependencyError> {
            assert_eq!(letter.stage, Stage::EvaluateAlert);
            self.received.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_full_queue_dead_letters_off_the_calling_path() {
        let dead_letters = Arc::new(StalledDeadLetters::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let config = AlertsConfig {
            queue_capacity: 1,
            ..config()
        };
        let (dispatcher, _handle) = AlertDispatcher::spawn(
            Arc::new(StalledSink),
            dead_letters.clone(),
            &config,
            metrics.clone(),
            CancellationToken::new(),
        );

        let ev = envelope("ev-1", 15_000.0, "2025-07-07T17:00:00Z");
        let v = verdict("ev-1", AnomalyFlag::Anomalous);
        for _ in 0..2 {
            let key = DedupKey::new("C001", ev.timestamp, 300);
            dispatcher.enqueue(AlertRecord::new(&ev, &v, AlertReason::Anomalous, key));
        }
        assert_eq!(PipelineMetrics::get(&metrics.alert_dispatch_failures), 1);
        assert_eq!(dispatcher.outstanding(), 1);

        for _ in 0..100 {
            if dead_letters.received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(dead_letters.received.load(Ordering::SeqCst), 1);
    }
}
