//! JetStream-backed stream source.
//!
//! Partition N is the subject `{subject_prefix}.N`, read through its own
//! durable pull consumer with explicit acks. A record's position is its
//! stream sequence. Fetched messages stay pending until the pipeline acks
//! a position at or above them; anything left unacked is redelivered by
//! the server after its ack wait.

use crate::config::{NatsConfig, SourceConfig};
use crate::source::StreamSource;
use crate::types::envelope::RawRecord;
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, stream::Config as StreamConfig, Message};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct PartitionConsumer {
    consumer: PullConsumer,
    /// Fetched but not yet acked, keyed by stream sequence
    pending: Mutex<BTreeMap<u64, Message>>,
}

/// Stream source over one JetStream stream
pub struct NatsStreamSource {
    partitions: HashMap<u32, PartitionConsumer>,
    batch_size: usize,
    max_wait: Duration,
}

impl NatsStreamSource {
    pub async fn connect(
        jetstream: &jetstream::Context,
        nats: &NatsConfig,
        source: &SourceConfig,
    ) -> Result<Self> {
        ensure_stream(jetstream, &nats.stream, &nats.subject_prefix).await?;

        let mut partitions = HashMap::new();
        for partition in 0..source.partitions {
            let name = format!("{}-{}", nats.consumer_prefix, partition);
            let subject = format!("{}.{}", nats.subject_prefix, partition);

            let consumer = jetstream
                .create_consumer_on_stream(
                    jetstream::consumer::pull::Config {
                        name: Some(name.clone()),
                        durable_name: Some(name.clone()),
                        filter_subject: subject.clone(),
                        ack_policy: jetstream::consumer::AckPolicy::Explicit,
                        ..Default::default()
                    },
                    nats.stream.as_str(),
                )
                .await
                .with_context(|| format!("Failed to create consumer {name}"))?;

            debug!(consumer = %name, subject = %subject, "Partition consumer ready");
            partitions.insert(
                partition,
                PartitionConsumer {
                    consumer,
                    pending: Mutex::new(BTreeMap::new()),
                },
            );
        }

        info!(
            stream = %nats.stream,
            partitions = source.partitions,
            "JetStream source connected"
        );

        Ok(Self {
            partitions,
            batch_size: source.batch_size.max(1),
            max_wait: Duration::from_millis(source.max_wait_ms.max(1)),
        })
    }

    fn partition(&self, partition: u32) -> Result<&PartitionConsumer> {
        self.partitions
            .get(&partition)
            .ok_or_else(|| anyhow!("unknown partition {partition}"))
    }
}

async fn ensure_stream(
    jetstream: &jetstream::Context,
    stream: &str,
    subject_prefix: &str,
) -> Result<()> {
    if jetstream.get_stream(stream).await.is_ok() {
        debug!(stream, "Stream already exists");
        return Ok(());
    }

    jetstream
        .create_stream(StreamConfig {
            name: stream.to_string(),
            subjects: vec![format!("{subject_prefix}.*")],
            description: Some("Raw transaction records, one subject per partition".to_string()),
            ..Default::default()
        })
        .await
        .context("Failed to create stream")?;
    info!(stream, "Created stream");
    Ok(())
}

#[async_trait]
impl StreamSource for NatsStreamSource {
    fn partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.partitions.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    async fn next_batch(&self, partition: u32) -> Result<Vec<RawRecord>> {
        let consumer = self.partition(partition)?;

        let mut messages = consumer
            .consumer
            .fetch()
            .max_messages(self.batch_size)
            .expires(self.max_wait)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut batch = Vec::new();
        let mut pending = consumer.pending.lock().await;
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    error!(partition, error = %e, "Error receiving message");
                    continue;
                }
            };
            let sequence = match message.info() {
                Ok(info) => info.stream_sequence,
                Err(e) => {
                    warn!(partition, error = %e, "Message without JetStream metadata, skipping");
                    continue;
                }
            };

            batch.push(RawRecord::new(partition, sequence, message.payload.clone()));
            pending.insert(sequence, message);
        }

        batch.sort_by_key(|r| r.position);
        Ok(batch)
    }

    async fn ack(&self, partition: u32, position: u64) -> Result<()> {
        let consumer = self.partition(partition)?;
        let mut pending = consumer.pending.lock().await;

        let remaining = pending.split_off(&position.saturating_add(1));
        let acked = std::mem::replace(&mut *pending, remaining);
        drop(pending);

        for (sequence, message) in acked {
            message
                .ack()
                .await
                .map_err(|e| {
                    anyhow!("Failed to ack sequence {sequence} on partition {partition}: {e}")
                })?;
        }
        debug!(partition, position, "Acked");
        Ok(())
    }
}
