//! Stream source abstraction.
//!
//! A source is a set of partitions, each an ordered log of raw records.
//! Records for the same entity id always land in the same partition, so a
//! single worker per partition sees them in arrival order. Delivery is
//! at-least-once: anything not acked is delivered again after a restart.

use crate::types::envelope::RawRecord;
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

/// Partitioned, at-least-once record source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Partitions this source serves
    fn partitions(&self) -> Vec<u32>;

    /// Next batch of records for a partition, in order. Empty when idle.
    async fn next_batch(&self, partition: u32) -> Result<Vec<RawRecord>>;

    /// Acknowledge every record of `partition` at or below `position`
    async fn ack(&self, partition: u32, position: u64) -> Result<()>;
}

/// Stable partition assignment for an entity id (FNV-1a).
pub fn partition_for(entity_id: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in entity_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<Bytes>,
    /// Index of the next record to hand out
    cursor: usize,
    /// Number of records acknowledged (positions 1..=committed)
    committed: usize,
}

/// In-memory partitioned log.
///
/// Positions start at 1. `rewind` moves every read cursor back to its last
/// committed position, which is what a consumer sees after a crash.
pub struct InMemoryStreamSource {
    partitions: u32,
    batch_size: usize,
    logs: Mutex<HashMap<u32, PartitionLog>>,
}

impl InMemoryStreamSource {
    pub fn new(partitions: u32, batch_size: usize) -> Self {
        let partitions = partitions.max(1);
        let logs = (0..partitions).map(|p| (p, PartitionLog::default())).collect();
        Self {
            partitions,
            batch_size: batch_size.max(1),
            logs: Mutex::new(logs),
        }
    }

    /// Append a payload to the partition its entity id maps to.
    /// Returns (partition, position).
    pub fn publish(&self, entity_id: &str, payload: impl Into<Bytes>) -> (u32, u64) {
        let partition = partition_for(entity_id, self.partitions);
        let position = self.publish_to(partition, payload);
        (partition, position)
    }

    /// Append a payload to an explicit partition (for keyless or malformed records)
    pub fn publish_to(&self, partition: u32, payload: impl Into<Bytes>) -> u64 {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let log = logs.entry(partition % self.partitions).or_default();
        log.records.push(payload.into());
        log.records.len() as u64
    }

    /// Simulate a consumer restart: unacked records will be delivered again
    pub fn rewind(&self) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        for log in logs.values_mut() {
            log.cursor = log.committed;
        }
    }

    /// Highest acknowledged position of a partition
    pub fn committed(&self, partition: u32) -> u64 {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(&partition).map(|l| l.committed as u64).unwrap_or(0)
    }

    /// Records published but not yet acknowledged, across all partitions
    pub fn pending(&self) -> usize {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.values().map(|l| l.records.len() - l.committed).sum()
    }
}

#[async_trait]
impl StreamSource for InMemoryStreamSource {
    fn partitions(&self) -> Vec<u32> {
        (0..self.partitions).collect()
    }

    async fn next_batch(&self, partition: u32) -> Result<Vec<RawRecord>> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&partition) else {
            bail!("unknown partition {partition}");
        };

        let end = (log.cursor + self.batch_size).min(log.records.len());
        let batch: Vec<RawRecord> = log.records[log.cursor..end]
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                RawRecord::new(partition, (log.cursor + i + 1) as u64, payload.clone())
            })
            .collect();
        log.cursor = end;
        Ok(batch)
    }

    async fn ack(&self, partition: u32, position: u64) -> Result<()> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&partition) else {
            bail!("unknown partition {partition}");
        };
        let position = (position as usize).min(log.records.len());
        if position > log.committed {
            log.committed = position;
        }
        Ok(())
    }
}
