//! Transaction Anomaly Pipeline - Main Entry Point
//!
//! Pulls transaction records from the configured source, scores them,
//! maintains per-customer aggregates and publishes deduplicated alerts.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transaction_anomaly_pipeline::{
    alert_router::{AlertDispatcher, AlertRouter},
    audit::{AuditRepository, InMemoryAuditRepository},
    config::{AppConfig, LoggingConfig, SourceBackend, StoreBackend},
    consumer::NatsStreamSource,
    metrics::{MetricsReporter, PipelineMetrics},
    pipeline::{Pipeline, PipelineComponents},
    postgres::PostgresAggregateRepository,
    producer::NatsPublisher,
    scoring::{HttpScoringCollaborator, ScoringClient},
    sink::{DeadLetterSink, MemorySink, NotificationSink},
    source::{InMemoryStreamSource, StreamSource},
    state_store::{AggregateRepository, InMemoryAggregateRepository, StateStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
    let config = AppConfig::load_from_path(&config_path)?;

    init_logging(&config.logging)?;
    info!(config = %config_path, "Starting Transaction Anomaly Pipeline");
    info!(
        "Risk tiers: low<={:.0}, medium<={:.0}, high above; alert bucket {}s",
        config.risk.medium_floor, config.risk.high_floor, config.alerts.bucket_secs
    );

    let metrics = Arc::new(PipelineMetrics::new());
    let ctx = CancellationToken::new();

    // Source and outbound sinks
    let (source, notifications, dead_letters): (
        Arc<dyn StreamSource>,
        Arc<dyn NotificationSink>,
        Arc<dyn DeadLetterSink>,
    ) = match config.source.backend {
        SourceBackend::Nats => {
            let client = async_nats::connect(&config.nats.url)
                .await
                .context("Failed to connect to NATS")?;
            info!("Connected to NATS at {}", config.nats.url);

            let jetstream = async_nats::jetstream::new(client.clone());
            let source: Arc<dyn StreamSource> = Arc::new(
                NatsStreamSource::connect(&jetstream, &config.nats, &config.source).await?,
            );
            info!("Publishing alerts to: {}", config.nats.alert_subject);
            info!("Dead letters go to: {}", config.nats.dead_letter_subject);
            let alerts: Arc<dyn NotificationSink> =
                Arc::new(NatsPublisher::new(client.clone(), &config.nats.alert_subject));
            let dead_letters: Arc<dyn DeadLetterSink> =
                Arc::new(NatsPublisher::new(client, &config.nats.dead_letter_subject));
            (source, alerts, dead_letters)
        }
        SourceBackend::Memory => {
            warn!("In-memory source configured; records must be published in-process");
            let sink = Arc::new(MemorySink::new());
            let alerts: Arc<dyn NotificationSink> = sink.clone();
            let dead_letters: Arc<dyn DeadLetterSink> = sink;
            let source: Arc<dyn StreamSource> = Arc::new(InMemoryStreamSource::new(
                config.source.partitions,
                config.source.batch_size,
            ));
            (source, alerts, dead_letters)
        }
    };

    // Aggregate persistence and audit trail
    let (repository, audit): (Arc<dyn AggregateRepository>, Arc<dyn AuditRepository>) =
        match config.store.backend {
            StoreBackend::Postgres => {
                let repo = Arc::new(PostgresAggregateRepository::new(&config.store.postgres)?);
                repo.migrate().await?;
                info!(
                    host = %config.store.postgres.host,
                    dbname = %config.store.postgres.dbname,
                    "Postgres aggregate store ready"
                );
                let aggregates: Arc<dyn AggregateRepository> = repo.clone();
                let audit: Arc<dyn AuditRepository> = repo;
                (aggregates, audit)
            }
            StoreBackend::Memory => {
                warn!("In-memory aggregate store configured; aggregates are lost on restart");
                let aggregates: Arc<dyn AggregateRepository> =
                    Arc::new(InMemoryAggregateRepository::new());
                let audit: Arc<dyn AuditRepository> = Arc::new(InMemoryAuditRepository::new());
                (aggregates, audit)
            }
        };

    let collaborator = HttpScoringCollaborator::new(&config.scoring.endpoint)?;
    info!(
        endpoint = collaborator.endpoint(),
        timeout_ms = config.scoring.timeout_ms,
        "Scoring client ready"
    );

    let (dispatcher, dispatcher_handle) = AlertDispatcher::spawn(
        notifications,
        dead_letters.clone(),
        &config.alerts,
        metrics.clone(),
        ctx.clone(),
    );

    let pipeline = Arc::new(Pipeline::new(
        PipelineComponents {
            source,
            scoring: ScoringClient::new(Arc::new(collaborator), &config.scoring, metrics.clone()),
            store: StateStore::new(
                repository,
                &config.store,
                config.risk.clone(),
                config.alerts.spike.clone(),
                metrics.clone(),
            )
            .with_audit(audit),
            router: AlertRouter::new(&config.alerts, metrics.clone()),
            dispatcher: Arc::new(dispatcher),
            dead_letters,
        },
        &config.pipeline,
        metrics.clone(),
    ));

    if config.pipeline.metrics_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs);
        tokio::spawn(reporter.start(ctx.clone()));
    }

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining in-flight envelopes");
        shutdown.cancel();
    });

    info!(
        partitions = config.source.partitions,
        workers = config.pipeline.workers,
        "Pipeline running"
    );
    pipeline.run(ctx).await;

    if let Err(e) = dispatcher_handle.await {
        warn!(error = %e, "Alert dispatcher task failed");
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format == "pretty" {
        builder.pretty().try_init()
    } else {
        builder.json().with_target(false).try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
