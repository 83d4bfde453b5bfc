//! Outbound sinks for alerts and dead letters.
//!
//! The NATS-backed implementations live in `producer`; `MemorySink` keeps
//! everything in process and is what the memory backends and tests use.

use crate::error::DependencyError;
use crate::types::alert::AlertMessage;
use crate::types::dead_letter::DeadLetter;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{info, warn};

/// Fire-and-forget alert delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, message: &AlertMessage) -> Result<(), DependencyError>;
}

/// Destination for records and alerts that could not be processed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DependencyError>;
}

/// In-process sink that records (and logs) everything it receives
#[derive(Default)]
pub struct MemorySink {
    alerts: Mutex<Vec<AlertMessage>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<AlertMessage> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn publish(&self, message: &AlertMessage) -> Result<(), DependencyError> {
        info!(
            alert_id = %message.alert_id,
            entity_id = %message.entity_id,
            envelope_id = %message.envelope_id,
            score = message.score,
            "ALERT"
        );
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for MemorySink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DependencyError> {
        warn!(
            stage = %letter.stage,
            reason = %letter.reason,
            envelope_id = letter.envelope_id.as_deref().unwrap_or("-"),
            "Dead-lettered"
        );
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter.clone());
        Ok(())
    }
}
