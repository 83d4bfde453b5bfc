//! Anomaly scoring against an external model-serving collaborator.
//!
//! The client is fail-open: when the collaborator times out, keeps failing,
//! or rejects the request, the envelope still flows on with an
//! `UnknownOnFailure` verdict and the degraded-scoring counter goes up.

use crate::config::ScoringConfig;
use crate::error::DependencyError;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use crate::types::envelope::Envelope;
use crate::types::verdict::{AnomalyFlag, Verdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Request body sent to the collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub amount: f64,
    pub context: ScoreContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreContext {
    pub entity_id: String,
    pub envelope_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ScoreRequest {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            amount: envelope.amount,
            context: ScoreContext {
                entity_id: envelope.entity_id.clone(),
                envelope_id: envelope.envelope_id.clone(),
                timestamp: envelope.timestamp,
                category: envelope.category.clone(),
            },
        }
    }
}

/// Collaborator response: `prediction` is -1 for an outlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub prediction: i64,
    #[serde(default)]
    pub score: f64,
}

/// One request/response exchange with the scoring service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoringCollaborator: Send + Sync {
    async fn invoke(&self, request: &ScoreRequest) -> Result<ScoreResponse, DependencyError>;
}

/// JSON-over-HTTP scoring endpoint
pub struct HttpScoringCollaborator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScoringCollaborator {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .build()
            .context("Failed to build scoring HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Timeouts, throttling and 5xx are worth retrying; other 4xx are not
fn classify_status(status: reqwest::StatusCode) -> DependencyError {
    let msg = format!("scoring endpoint returned {status}");
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        DependencyError::Transient(msg)
    } else {
        DependencyError::Permanent(msg)
    }
}

#[async_trait]
impl ScoringCollaborator for HttpScoringCollaborator {
    async fn invoke(&self, request: &ScoreRequest) -> Result<ScoreResponse, DependencyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    DependencyError::transient(e.to_string())
                } else {
                    DependencyError::permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response
            .json::<ScoreResponse>()
            .await
            .map_err(|e| DependencyError::permanent(format!("undecodable score response: {e}")))
    }
}

/// Retry/timeout wrapper that always produces a verdict
pub struct ScoringClient {
    collaborator: Arc<dyn ScoringCollaborator>,
    retry: RetryPolicy,
    timeout: Duration,
    /// Bounds concurrent calls; waiting here is how saturation backs up
    in_flight: Semaphore,
    metrics: Arc<PipelineMetrics>,
}

impl ScoringClient {
    pub fn new(
        collaborator: Arc<dyn ScoringCollaborator>,
        config: &ScoringConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            collaborator,
            retry: config.retry.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            metrics,
        }
    }

    /// Score one envelope. Never fails; degraded outcomes are UnknownOnFailure.
    pub async fn score(&self, envelope: &Envelope) -> Verdict {
        let request = ScoreRequest::from_envelope(envelope);
        let started = Instant::now();

        let result = match self.in_flight.acquire().await {
            Ok(_permit) => {
                self.retry
                    .run("scoring", |_| self.invoke_with_timeout(&request))
                    .await
            }
            Err(_) => Err(crate::retry::RetryExhausted {
                error: DependencyError::permanent("scoring client closed"),
                attempts: 0,
            }),
        };

        let latency = started.elapsed();
        let verdict = match result {
            Ok((response, attempts)) => {
                let flag = AnomalyFlag::from_prediction(response.prediction);
                debug!(
                    envelope_id = %envelope.envelope_id,
                    entity_id = %envelope.entity_id,
                    prediction = response.prediction,
                    score = response.score,
                    attempts,
                    latency_us = latency.as_micros() as u64,
                    "Envelope scored"
                );
                Verdict {
                    envelope_id: envelope.envelope_id.clone(),
                    flag,
                    score: response.score,
                    latency,
                    attempts,
                }
            }
            Err(exhausted) => {
                warn!(
                    envelope_id = %envelope.envelope_id,
                    entity_id = %envelope.entity_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Scoring failed, continuing with unknown verdict"
                );
                Verdict::unknown(envelope.envelope_id.clone(), latency, exhausted.attempts)
            }
        };

        self.metrics.record_verdict(verdict.flag, latency);
        verdict
    }

    async fn invoke_with_timeout(
        &self,
        request: &ScoreRequest,
    ) -> Result<ScoreResponse, DependencyError> {
        match tokio::time::timeout(self.timeout, self.collaborator.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(DependencyError::transient(format!(
                "scoring timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(amount: f64) -> Envelope {
        Envelope {
            envelope_id: "ev-1".to_string(),
            entity_id: "C001".to_string(),
            amount,
            timestamp: "2025-07-07T17:00:00Z".parse().unwrap(),
            category: Some("Online".to_string()),
            raw: serde_json::Map::new(),
            partition: 0,
            position: 1,
        }
    }

    fn config() -> ScoringConfig {
        ScoringConfig {
            timeout_ms: 50,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..ScoringConfig::default()
        }
    }

    #[tokio::test]
    async fn test_anomalous_prediction() {
        let mut collaborator = MockScoringCollaborator::new();
        collaborator
            .expect_invoke()
            .withf(|req: &ScoreRequest| req.amount == 15000.0 && req.context.entity_id == "C001")
            .times(1)
            .returning(|_| Ok(ScoreResponse { prediction: -1, score: -0.3 }));

        let metrics = Arc::new(PipelineMetrics::new());
        let client = ScoringClient::new(Arc::new(collaborator), &config(), metrics.clone());

        let verdict = client.score(&envelope(15000.0)).await;
        assert_eq!(verdict.flag, AnomalyFlag::Anomalous);
        assert_eq!(verdict.score, -0.3);
        assert_eq!(verdict.attempts, 1);
        assert_eq!(PipelineMetrics::get(&metrics.anomalous_verdicts), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut collaborator = MockScoringCollaborator::new();
        let mut seq = mockall::Sequence::new();
        collaborator
            .expect_invoke()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(DependencyError::transient("503")));
        collaborator
            .expect_invoke()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ScoreResponse { prediction: 1, score: 0.1 }));

        let metrics = Arc::new(PipelineMetrics::new());
        let client = ScoringClient::new(Arc::new(collaborator), &config(), metrics);

        let verdict = client.score(&envelope(500.0)).await;
        assert_eq!(verdict.flag, AnomalyFlag::Normal);
        assert_eq!(verdict.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_open_immediately() {
        let mut collaborator = MockScoringCollaborator::new();
        collaborator
            .expect_invoke()
            .times(1)
            .returning(|_| Err(DependencyError::permanent("400 bad request")));

        let metrics = Arc::new(PipelineMetrics::new());
        let client = ScoringClient::new(Arc::new(collaborator), &config(), metrics.clone());

        let verdict = client.score(&envelope(500.0)).await;
        assert_eq!(verdict.flag, AnomalyFlag::UnknownOnFailure);
        assert_eq!(verdict.attempts, 1);
        assert_eq!(PipelineMetrics::get(&metrics.scoring_degraded), 1);
    }

    struct SlowCollaborator;

    #[async_trait]
    impl ScoringCollaborator for SlowCollaborator {
        async fn invoke(&self, _request: &ScoreRequest) -> Result<ScoreResponse, DependencyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ScoreResponse { prediction: 1, score: 0.0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries_and_degrade() {
        let metrics = Arc::new(PipelineMetrics::new());
        let client = ScoringClient::new(Arc::new(SlowCollaborator), &config(), metrics.clone());

        let verdict = client.score(&envelope(500.0)).await;
        assert_eq!(verdict.flag, AnomalyFlag::UnknownOnFailure);
        assert_eq!(verdict.attempts, 3);
        assert_eq!(PipelineMetrics::get(&metrics.scoring_degraded), 1);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!classify_status(reqwest::StatusCode::BAD_REQUEST).is_transient());
        assert!(!classify_status(reqwest::StatusCode::UNAUTHORIZED).is_transient());
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(ScoreRequest::from_envelope(&envelope(15000.0))).unwrap();
        assert_eq!(json["amount"], 15000.0);
        assert_eq!(json["context"]["entity_id"], "C001");
        assert_eq!(json["context"]["category"], "Online");
    }
}
