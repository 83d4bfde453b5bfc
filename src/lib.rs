//! Transaction Anomaly Pipeline Library
//!
//! Ingests partitioned transaction records, validates them into envelopes,
//! scores each against an anomaly model, folds them into per-customer
//! aggregates and routes deduplicated alerts.

pub mod alert_router;
pub mod audit;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod postgres;
pub mod producer;
pub mod retry;
pub mod scoring;
pub mod sink;
pub mod source;
pub mod state_store;
pub mod types;
pub mod validator;

pub use alert_router::{AlertDecision, AlertDispatcher, AlertRouter};
pub use audit::{AuditEntry, AuditRepository, InMemoryAuditRepository};
pub use config::AppConfig;
pub use error::{DependencyError, StateStoreError, ValidationError};
pub use pipeline::{EnvelopeState, Pipeline, PipelineComponents};
pub use scoring::{HttpScoringCollaborator, ScoringClient, ScoringCollaborator};
pub use source::{InMemoryStreamSource, StreamSource};
pub use state_store::{
    AggregateRepository, ApplyOutcome, InMemoryAggregateRepository, StateStore,
};
pub use types::{AggregateState, Envelope, RawRecord, RiskTier, Verdict};
pub use validator::Validator;
