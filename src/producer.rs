//! NATS publishers for alerts and dead letters

use crate::error::DependencyError;
use crate::sink::{DeadLetterSink, NotificationSink};
use crate::types::alert::AlertMessage;
use crate::types::dead_letter::DeadLetter;
use async_nats::Client;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Publishes JSON messages on a fixed subject
#[derive(Clone)]
pub struct NatsPublisher {
    client: Client,
    subject: String,
}

impl NatsPublisher {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    async fn publish_json<T: Serialize + Sync>(&self, message: &T) -> Result<(), DependencyError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| DependencyError::permanent(format!("unencodable message: {e}")))?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| {
                DependencyError::transient(format!("nats publish to {}: {e}", self.subject))
            })
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl NotificationSink for NatsPublisher {
    async fn publish(&self, message: &AlertMessage) -> Result<(), DependencyError> {
        self.publish_json(message).await?;
        debug!(
            alert_id = %message.alert_id,
            entity_id = %message.entity_id,
            subject = %self.subject,
            "Published alert"
        );
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for NatsPublisher {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DependencyError> {
        self.publish_json(letter).await?;
        debug!(stage = %letter.stage, subject = %self.subject, "Published dead letter");
        Ok(())
    }
}
