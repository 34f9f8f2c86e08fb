//! Partitioned event log abstraction
//!
//! The publisher appends per-partition batches; each ingestion worker fetches
//! its partition from a committed offset and commits progress per consumer
//! group. Offsets are dense and start at 0 in every partition.

use crate::pipeline::types::TelemetryEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("partition {partition} out of range (topic has {count})")]
    UnknownPartition { partition: u32, count: u32 },

    #[error("topic '{topic}' exists with {existing} partitions, requested {requested}")]
    TopicMismatch {
        topic: String,
        existing: u32,
        requested: u32,
    },

    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub partition: u32,
    pub offset: u64,
    pub event: TelemetryEvent,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    fn topic(&self) -> &str;

    fn partition_count(&self) -> u32;

    /// Append in order; returns the offset after the last appended record.
    async fn append(&self, partition: u32, events: &[TelemetryEvent]) -> Result<u64, LogError>;

    /// Up to `max` entries starting at `from`, in offset order.
    async fn fetch(&self, partition: u32, from: u64, max: usize) -> Result<Vec<LogEntry>, LogError>;

    /// Record `next_offset` as the next record `group` will read.
    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), LogError>;

    /// Next offset to read for `group` (0 if never committed).
    async fn committed(&self, group: &str, partition: u32) -> Result<u64, LogError>;

    async fn end_offset(&self, partition: u32) -> Result<u64, LogError>;
}

pub(crate) fn check_partition(partition: u32, count: u32) -> Result<(), LogError> {
    if partition >= count {
        return Err(LogError::UnknownPartition { partition, count });
    }
    Ok(())
}

/// In-process log. Used by tests and for running without a broker file.
pub struct MemoryEventLog {
    topic: String,
    partitions: Vec<Mutex<Vec<TelemetryEvent>>>,
    offsets: Mutex<HashMap<(String, u32), u64>>,
    failures_remaining: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new(topic: &str, partitions: u32) -> Self {
        Self {
            topic: topic.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            offsets: Mutex::new(HashMap::new()),
            failures_remaining: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` appends.
    pub fn inject_append_failures(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// While unavailable, every append fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Events of one partition, in offset order.
    pub fn events(&self, partition: u32) -> Vec<TelemetryEvent> {
        self.partitions
            .get(partition as usize)
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    pub fn total_events(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Vec<TelemetryEvent>>, LogError> {
        check_partition(partition, self.partition_count())?;
        Ok(&self.partitions[partition as usize])
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, partition: u32, events: &[TelemetryEvent]) -> Result<u64, LogError> {
        let slot = self.partition(partition)?;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("broker offline".to_string()));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LogError::Unavailable("injected append failure".to_string()));
        }

        let mut records = slot.lock().unwrap_or_else(PoisonError::into_inner);
        records.extend_from_slice(events);
        Ok(records.len() as u64)
    }

    async fn fetch(&self, partition: u32, from: u64, max: usize) -> Result<Vec<LogEntry>, LogError> {
        let records = self.partition(partition)?.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(offset, event)| LogEntry {
                partition,
                offset: offset as u64,
                event: event.clone(),
            })
            .collect())
    }

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), LogError> {
        check_partition(partition, self.partition_count())?;
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((group.to_string(), partition), next_offset);
        Ok(())
    }

    async fn committed(&self, group: &str, partition: u32) -> Result<u64, LogError> {
        check_partition(partition, self.partition_count())?;
        Ok(self
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(group.to_string(), partition))
            .copied()
            .unwrap_or(0))
    }

    async fn end_offset(&self, partition: u32) -> Result<u64, LogError> {
        Ok(self.partition(partition)?.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::utc_from_millis;

    fn event(car: &str, ts: u64) -> TelemetryEvent {
        TelemetryEvent::new("s1", car, "speed", "200", ts, utc_from_millis(ts as i64))
    }

    #[tokio::test]
    async fn test_append_fetch_commit() {
        let log = MemoryEventLog::new("t", 2);
        assert_eq!(log.append(1, &[event("44", 1), event("44", 2)]).await.unwrap(), 2);
        assert_eq!(log.append(1, &[event("44", 3)]).await.unwrap(), 3);

        let entries = log.fetch(1, 1, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 1);
        assert_eq!(entries[1].event.timestamp_monotonic, 3);

        assert_eq!(log.committed("g", 1).await.unwrap(), 0);
        log.commit("g", 1, 3).await.unwrap();
        assert_eq!(log.committed("g", 1).await.unwrap(), 3);
        assert_eq!(log.committed("other", 1).await.unwrap(), 0);
        assert_eq!(log.end_offset(1).await.unwrap(), 3);
        assert_eq!(log.end_offset(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_partition_rejected() {
        let log = MemoryEventLog::new("t", 2);
        assert!(matches!(
            log.append(2, &[event("1", 1)]).await,
            Err(LogError::UnknownPartition { partition: 2, count: 2 })
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let log = MemoryEventLog::new("t", 1);
        log.inject_append_failures(2);
        assert!(log.append(0, &[event("1", 1)]).await.is_err());
        assert!(log.append(0, &[event("1", 1)]).await.is_err());
        assert!(log.append(0, &[event("1", 1)]).await.is_ok());

        log.set_available(false);
        assert!(log.append(0, &[event("1", 2)]).await.is_err());
        log.set_available(true);
        assert_eq!(log.total_events(), 1);
    }
}
