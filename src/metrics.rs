//! Pipeline health counters and latency statistics.
//!
//! Counters are the operator-facing signal for degraded behavior: scoring
//! coverage (`scoring_degraded`), dead-letter volume, consistency violations
//! and alert dispatch failures.

use crate::types::verdict::AnomalyFlag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sample windows are trimmed back to half when they exceed this
const MAX_SAMPLES: usize = 10_000;

/// Metrics collector for pipeline health
pub struct PipelineMetrics {
    /// Raw records pulled from the source
    pub records_received: AtomicU64,
    /// Records rejected by the validator
    pub records_rejected: AtomicU64,
    /// Verdicts returned by the scoring client
    pub envelopes_scored: AtomicU64,
    /// Verdicts that fell back to unknown-on-failure
    pub scoring_degraded: AtomicU64,
    pub anomalous_verdicts: AtomicU64,
    /// Updates applied to aggregates (duplicates excluded)
    pub state_applied: AtomicU64,
    /// Redelivered envelopes recognized by the dedup log
    pub duplicates_skipped: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub consistency_violations: AtomicU64,
    pub alerts_dispatched: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub alert_dispatch_failures: AtomicU64,
    /// Envelopes skipped because of cancellation (left unacked for replay)
    pub envelopes_abandoned: AtomicU64,
    /// Queued alerts dropped on shutdown
    pub alerts_abandoned: AtomicU64,
    /// Envelopes that reached Done
    pub envelopes_completed: AtomicU64,
    rejects_by_kind: RwLock<HashMap<String, u64>>,
    /// End-to-end envelope times (microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Scoring collaborator latencies (microseconds)
    scoring_times: RwLock<Vec<u64>>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            records_received: AtomicU64::new(0),
            records_rejected: AtomicU64::new(0),
            envelopes_scored: AtomicU64::new(0),
            scoring_degraded: AtomicU64::new(0),
            anomalous_verdicts: AtomicU64::new(0),
            state_applied: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            consistency_violations: AtomicU64::new(0),
            alerts_dispatched: AtomicU64::new(0),
            alerts_suppressed: AtomicU64::new(0),
            alert_dispatch_failures: AtomicU64::new(0),
            envelopes_abandoned: AtomicU64::new(0),
            alerts_abandoned: AtomicU64::new(0),
            envelopes_completed: AtomicU64::new(0),
            rejects_by_kind: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            scoring_times: RwLock::new(Vec::with_capacity(1000)),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn record_rejection(&self, kind: &str) {
        Self::incr(&self.records_rejected);
        if let Ok(mut by_kind) = self.rejects_by_kind.write() {
            *by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_verdict(&self, flag: AnomalyFlag, latency: Duration) {
        Self::incr(&self.envelopes_scored);
        match flag {
            AnomalyFlag::Anomalous => Self::incr(&self.anomalous_verdicts),
            AnomalyFlag::UnknownOnFailure => Self::incr(&self.scoring_degraded),
            AnomalyFlag::Normal => {}
        }
        push_sample(&self.scoring_times, latency);
    }

    pub fn record_completed(&self, processing_time: Duration) {
        Self::incr(&self.envelopes_completed);
        push_sample(&self.processing_times, processing_time);
    }

    pub fn add_received(&self, count: u64) {
        self.records_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_abandoned(&self, count: u64) {
        self.envelopes_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_processing_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.processing_times)
    }

    pub fn get_scoring_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.scoring_times)
    }

    pub fn get_rejects_by_kind(&self) -> HashMap<String, u64> {
        self.rejects_by_kind
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Fraction of scored envelopes that got a real verdict
    pub fn scoring_coverage(&self) -> f64 {
        let scored = Self::get(&self.envelopes_scored);
        if scored == 0 {
            return 1.0;
        }
        1.0 - Self::get(&self.scoring_degraded) as f64 / scored as f64
    }

    /// Envelopes completed per second since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            Self::get(&self.envelopes_completed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        let processing = self.get_processing_stats();
        let scoring = self.get_scoring_stats();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║         TRANSACTION ANOMALY PIPELINE - METRICS SUMMARY       ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Records Received: {:>8}  │  Rejected: {:>8}              ║",
            Self::get(&self.records_received),
            Self::get(&self.records_rejected)
        );
        info!(
            "║ Completed:        {:>8}  │  Throughput: {:>6.1} ev/s       ║",
            Self::get(&self.envelopes_completed),
            self.get_throughput()
        );
        info!(
            "║ Anomalous:        {:>8}  │  Scoring Coverage: {:>5.1}%     ║",
            Self::get(&self.anomalous_verdicts),
            self.scoring_coverage() * 100.0
        );
        info!(
            "║ Duplicates:       {:>8}  │  Dead-lettered: {:>8}         ║",
            Self::get(&self.duplicates_skipped),
            Self::get(&self.dead_lettered)
        );
        info!(
            "║ Alerts Sent:      {:>8}  │  Suppressed: {:>8}  Failed: {:>4} ║",
            Self::get(&self.alerts_dispatched),
            Self::get(&self.alerts_suppressed),
            Self::get(&self.alert_dispatch_failures)
        );
        info!(
            "║ Consistency Violations: {:>4}  │  Abandoned: {:>8}          ║",
            Self::get(&self.consistency_violations),
            Self::get(&self.envelopes_abandoned)
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing (μs): mean={:>6} p50={:>6} p95={:>6} p99={:>6} ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        info!(
            "║ Scoring (μs):    mean={:>6} p50={:>6} p95={:>6} p99={:>6} ║",
            scoring.mean_us, scoring.p50_us, scoring.p95_us, scoring.p99_us
        );
        info!("╚══════════════════════════════════════════════════════════════╝");

        let rejects = self.get_rejects_by_kind();
        if !rejects.is_empty() {
            info!("Rejected records by kind:");
            for (kind, count) in &rejects {
                info!("  {}: {}", kind, count);
            }
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &RwLock<Vec<u64>>, value: Duration) {
    if let Ok(mut times) = samples.write() {
        times.push(value.as_micros() as u64);
        if times.len() > MAX_SAMPLES {
            times.drain(0..MAX_SAMPLES / 2);
        }
    }
}

/// Latency statistics over the retained sample window
#[derive(Debug, Default)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    fn from_samples(samples: &RwLock<Vec<u64>>) -> Self {
        let Ok(times) = samples.read() else {
            return Self::default();
        };
        if times.is_empty() {
            return Self::default();
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        Self {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }
}

/// Prints a summary on a fixed interval until cancelled
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    pub async fn start(self, ctx: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = interval.tick() => self.metrics.print_summary(),
            }
        }
    }
}
