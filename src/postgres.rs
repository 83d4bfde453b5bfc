//! Postgres-backed aggregate repository and audit trail

use crate::audit::{AuditEntry, AuditRepository};
use crate::config::PostgresConfig;
use crate::error::DependencyError;
use crate::state_store::{AggregateRecord, AggregateRepository, AppliedEnvelope, UpsertOutcome};
use crate::types::aggregate::{AggregateState, RiskTier};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entity_aggregates (
    entity_id        TEXT PRIMARY KEY,
    total_amount     DOUBLE PRECISION NOT NULL,
    event_count      BIGINT NOT NULL,
    last_seen        TIMESTAMPTZ,
    risk_tier        TEXT NOT NULL,
    open_alert       BOOLEAN NOT NULL DEFAULT FALSE,
    recent_envelopes JSONB NOT NULL DEFAULT '[]'::jsonb,
    updated_at       TIMESTAMPTZ NOT NULL
)";

const CREATE_AUDIT_TABLE: &str = "CREATE TABLE IF NOT EXISTS envelope_audit (
    envelope_id  TEXT PRIMARY KEY,
    entity_id    TEXT NOT NULL,
    amount       DOUBLE PRECISION NOT NULL,
    event_time   TIMESTAMPTZ NOT NULL,
    category     TEXT,
    flag         TEXT NOT NULL,
    score        DOUBLE PRECISION NOT NULL,
    partition_id BIGINT NOT NULL,
    position     BIGINT NOT NULL,
    recorded_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS envelope_audit_entity_idx
    ON envelope_audit (entity_id, recorded_at)";

const INSERT_AUDIT: &str = "INSERT INTO envelope_audit
        (envelope_id, entity_id, amount, event_time, category, flag, score,
         partition_id, position, recorded_at)
 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
 ON CONFLICT (envelope_id) DO NOTHING";

const SELECT_AGGREGATE: &str = "SELECT entity_id, total_amount, event_count, last_seen, risk_tier,
        open_alert, recent_envelopes
   FROM entity_aggregates
  WHERE entity_id = $1";

// Zero rows affected means the stored event_count moved
const UPSERT_AGGREGATE: &str = "INSERT INTO entity_aggregates
        (entity_id, total_amount, event_count, last_seen, risk_tier, open_alert, recent_envelopes, updated_at)
 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
 ON CONFLICT (entity_id) DO UPDATE SET
        total_amount = EXCLUDED.total_amount,
        event_count = EXCLUDED.event_count,
        last_seen = EXCLUDED.last_seen,
        risk_tier = EXCLUDED.risk_tier,
        open_alert = EXCLUDED.open_alert,
        recent_envelopes = EXCLUDED.recent_envelopes,
        updated_at = EXCLUDED.updated_at
  WHERE entity_aggregates.event_count = $9";

/// Aggregate repository over a deadpool connection pool
#[derive(Clone)]
pub struct PostgresAggregateRepository {
    pool: Pool,
}

impl PostgresAggregateRepository {
    pub fn new(config: &PostgresConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create Postgres pool")?;
        pool.resize(config.pool_size.max(1));

        Ok(Self { pool })
    }

    /// Create the aggregate and audit tables if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get Postgres connection")?;
        client
            .batch_execute(CREATE_TABLE)
            .await
            .context("Failed to create entity_aggregates table")?;
        client
            .batch_execute(CREATE_AUDIT_TABLE)
            .await
            .context("Failed to create envelope_audit table")?;
        info!("entity_aggregates and envelope_audit tables ready");
        Ok(())
    }

    async fn connection(&self) -> Result<deadpool_postgres::Client, DependencyError> {
        self.pool.get().await.map_err(classify_pool_error)
    }
}

fn classify_pool_error(e: PoolError) -> DependencyError {
    match e {
        PoolError::Backend(e) => classify_db_error(e),
        other => DependencyError::transient(format!("postgres pool: {other}")),
    }
}

/// Connection loss, serialization failures and resource exhaustion are retried
fn classify_db_error(e: tokio_postgres::Error) -> DependencyError {
    match e.as_db_error() {
        Some(db) => {
            let code = db.code().code();
            let transient = ["08", "40", "53", "57P"]
                .iter()
                .any(|class| code.starts_with(class));
            if transient {
                DependencyError::transient(format!("postgres {code}: {}", db.message()))
            } else {
                DependencyError::permanent(format!("postgres {code}: {}", db.message()))
            }
        }
        None => DependencyError::transient(format!("postgres: {e}")),
    }
}

fn row_to_record(row: &Row) -> Result<AggregateRecord, DependencyError> {
    let decode = |e: tokio_postgres::Error| {
        DependencyError::permanent(format!("undecodable aggregate row: {e}"))
    };

    let entity_id: String = row.try_get("entity_id").map_err(decode)?;
    let event_count: i64 = row.try_get("event_count").map_err(decode)?;
    let risk_tier: String = row.try_get("risk_tier").map_err(decode)?;
    let last_seen: Option<DateTime<Utc>> = row.try_get("last_seen").map_err(decode)?;
    let recent: serde_json::Value = row.try_get("recent_envelopes").map_err(decode)?;

    let risk_tier = risk_tier.parse::<RiskTier>().map_err(DependencyError::permanent)?;
    let recent_envelopes: Vec<AppliedEnvelope> = serde_json::from_value(recent)
        .map_err(|e| DependencyError::permanent(format!("undecodable recent_envelopes: {e}")))?;

    Ok(AggregateRecord {
        state: AggregateState {
            entity_id,
            total_amount: row.try_get("total_amount").map_err(decode)?,
            event_count: event_count.max(0) as u64,
            last_seen,
            risk_tier,
            open_alert: row.try_get("open_alert").map_err(decode)?,
        },
        recent_envelopes,
    })
}

#[async_trait]
impl AggregateRepository for PostgresAggregateRepository {
    async fn load(&self, entity_id: &str) -> Result<Option<AggregateRecord>, DependencyError> {
        debug!(entity_id, "Loading aggregate");
        let client = self.connection().await?;
        let row = client
            .query_opt(SELECT_AGGREGATE, &[&entity_id])
            .await
            .map_err(classify_db_error)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(
        &self,
        record: &AggregateRecord,
        expected_count: u64,
    ) -> Result<UpsertOutcome, DependencyError> {
        let client = self.connection().await?;
        let state = &record.state;
        let recent = serde_json::to_value(&record.recent_envelopes)
            .map_err(|e| DependencyError::permanent(format!("unencodable recent_envelopes: {e}")))?;
        let event_count = state.event_count as i64;
        let expected = expected_count as i64;
        let risk_tier = state.risk_tier.as_str();

        let affected = client
            .execute(
                UPSERT_AGGREGATE,
                &[
                    &state.entity_id,
                    &state.total_amount,
                    &event_count,
                    &state.last_seen,
                    &risk_tier,
                    &state.open_alert,
                    &recent,
                    &Utc::now(),
                    &expected,
                ],
            )
            .await
            .map_err(classify_db_error)?;

        if affected == 0 {
            Ok(UpsertOutcome::Conflict)
        } else {
            Ok(UpsertOutcome::Applied)
        }
    }
}

#[async_trait]
impl AuditRepository for PostgresAggregateRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), DependencyError> {
        let client = self.connection().await?;
        let partition = i64::from(entry.partition);
        let position = entry.position as i64;

        client
            .execute(
                INSERT_AUDIT,
                &[
                    &entry.envelope_id,
                    &entry.entity_id,
                    &entry.amount,
                    &entry.event_time,
                    &entry.category,
                    &entry.flag.as_str(),
                    &entry.score,
                    &partition,
                    &position,
                    &entry.recorded_at,
                ],
            )
            .await
            .map_err(classify_db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeouts_are_transient() {
        let err = classify_pool_error(PoolError::Timeout(deadpool_postgres::TimeoutType::Wait));
        assert!(err.is_transient());
    }

    #[test]
    fn test_upsert_is_conditional_on_event_count() {
        assert!(UPSERT_AGGREGATE.contains("ON CONFLICT (entity_id)"));
        assert!(UPSERT_AGGREGATE.contains("WHERE entity_aggregates.event_count = $9"));
    }

    #[test]
    fn test_audit_insert_is_idempotent_on_envelope_id() {
        assert!(CREATE_AUDIT_TABLE.contains("envelope_id  TEXT PRIMARY KEY"));
        assert!(INSERT_AUDIT.contains("ON CONFLICT (envelope_id) DO NOTHING"));
        assert_eq!(INSERT_AUDIT.matches('$').count(), 10);
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let repo = PostgresAggregateRepository::new(&PostgresConfig::default());
        assert!(repo.is_ok());
    }
}
