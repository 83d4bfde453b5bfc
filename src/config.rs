//! Configuration management for the anomaly pipeline

use crate::retry::RetryPolicy;
use crate::types::aggregate::{RiskTierThresholds, SpikeRule};
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub source: SourceConfig,
    pub scoring: ScoringConfig,
    pub store: StoreConfig,
    pub alerts: AlertsConfig,
    pub risk: RiskTierThresholds,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Records for partition N are published on `{subject_prefix}.N`
    pub subject_prefix: String,
    /// JetStream stream holding the records
    pub stream: String,
    /// Durable consumer names are `{consumer_prefix}-N`
    pub consumer_prefix: String,
    /// Subject for outgoing alerts
    pub alert_subject: String,
    /// Subject for dead-lettered records and alerts
    pub dead_letter_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "transactions".to_string(),
            stream: "TRANSACTIONS".to_string(),
            consumer_prefix: "anomaly-pipeline".to_string(),
            alert_subject: "anomaly.alerts".to_string(),
            dead_letter_subject: "anomaly.dead_letter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    /// In-process log, nothing survives a restart
    #[default]
    Memory,
    /// JetStream pull consumers
    Nats,
}

/// Stream source configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub backend: SourceBackend,
    pub partitions: u32,
    /// Maximum records per batch
    pub batch_size: usize,
    /// How long a pull waits for records before returning an empty batch
    pub max_wait_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: SourceBackend::Memory,
            partitions: 4,
            batch_size: 32,
            max_wait_ms: 500,
        }
    }
}

/// Scoring collaborator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub endpoint: String,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Concurrent requests allowed against the collaborator
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/predict".to_string(),
            timeout_ms: 2_000,
            max_in_flight: 64,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Postgres connection parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_size: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            dbname: "anomaly".to_string(),
            pool_size: 16,
        }
    }
}

/// Aggregate store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub postgres: PostgresConfig,
    pub retry: RetryPolicy,
    /// Envelope ids remembered per entity for redelivery detection
    pub dedup_capacity: usize,
    /// Wall-clock age after which remembered ids are forgotten
    pub dedup_retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            postgres: PostgresConfig::default(),
            retry: RetryPolicy::default(),
            dedup_capacity: 1024,
            dedup_retention_secs: 86_400,
        }
    }
}

/// Alert routing and dispatch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Width of a dedup bucket, in event-time seconds
    pub bucket_secs: i64,
    /// Buckets older than this many widths behind the newest are pruned
    pub retained_buckets: i64,
    /// Alerts waiting for dispatch; a full queue dead-letters new alerts
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub spike: SpikeRule,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 300,
            retained_buckets: 12,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
            spike: SpikeRule::default(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Envelopes processed concurrently across all partitions
    pub workers: usize,
    /// Pause after an empty batch
    pub idle_backoff_ms: u64,
    /// Pause after a source error
    pub error_backoff_ms: u64,
    /// Interval of the metrics summary; 0 disables it
    pub metrics_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            idle_backoff_ms: 50,
            error_backoff_ms: 1_000,
            metrics_interval_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path, then apply `PIPELINE__*`
    /// environment overrides (e.g. `PIPELINE__SCORING__TIMEOUT_MS=500`)
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("PIPELINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or misconfigure the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.source.partitions == 0 {
            anyhow::bail!("source.partitions must be at least 1");
        }
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.alerts.bucket_secs <= 0 {
            anyhow::bail!("alerts.bucket_secs must be positive");
        }
        if self.risk.medium_floor > self.risk.high_floor {
            anyhow::bail!(
                "risk.medium_floor ({}) must not exceed risk.high_floor ({})",
                self.risk.medium_floor,
                self.risk.high_floor
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.scoring.timeout_ms, 2_000);
        assert_eq!(config.scoring.retry.max_attempts, 3);
        assert_eq!(config.store.dedup_capacity, 1024);
        assert_eq!(config.alerts.bucket_secs, 300);
        assert_eq!(config.risk.medium_floor, 50_000.0);
        assert_eq!(config.source.backend, SourceBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = std::env::temp_dir()
            .join(format!("pipeline-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[scoring]\ntimeout_ms = 750\n\n[scoring.retry]\nmax_attempts = 5\n\n[store]\nbackend = \"postgres\"\n"
        )
        .unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.scoring.timeout_ms, 750);
        assert_eq!(config.scoring.retry.max_attempts, 5);
        assert_eq!(config.scoring.retry.initial_backoff_ms, 100);
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.pipeline.workers, 16);
    }

    #[test]
    fn test_validate_rejects_inverted_tiers() {
        let mut config = AppConfig::default();
        config.risk.medium_floor = 200_000.0;
        assert!(config.validate().is_err());
    }
}
