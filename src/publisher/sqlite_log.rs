//! Durable event log on SQLite
//!
//! Tables:
//! - `topics` - partition count per topic, fixed at creation
//! - `event_log` - one row per record, keyed (topic, partition_id, log_offset)
//! - `consumer_offsets` - next offset per (group, topic, partition_id)
//!
//! Publisher and ingester share one handle inside the runtime; a second
//! process can open the same file thanks to WAL mode.

use super::log::{check_partition, EventLog, LogEntry, LogError};
use crate::pipeline::types::TelemetryEvent;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct SqliteEventLog {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    partitions: u32,
}

impl SqliteEventLog {
    /// Open (or create) the log file and register `topic`.
    ///
    /// Arguments:
    /// - `db_path`: log file; parent directories are created
    /// - `topic`: topic name
    /// - `partitions`: must match the stored count if the topic exists
    pub fn open(db_path: &str, topic: &str, partitions: u32) -> Result<Self, LogError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                topic       TEXT PRIMARY KEY,
                partitions  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_log (
                topic         TEXT NOT NULL,
                partition_id  INTEGER NOT NULL,
                log_offset    INTEGER NOT NULL,
                car_number    TEXT NOT NULL,
                payload       TEXT NOT NULL,
                appended_at   INTEGER NOT NULL,
                PRIMARY KEY (topic, partition_id, log_offset)
            );

            CREATE TABLE IF NOT EXISTS consumer_offsets (
                group_id      TEXT NOT NULL,
                topic         TEXT NOT NULL,
                partition_id  INTEGER NOT NULL,
                next_offset   INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            );
            "#,
        )?;

        let existing: Option<u32> = conn
            .query_row(
                "SELECT partitions FROM topics WHERE topic = ?1",
                [topic],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(count) if count != partitions => {
                return Err(LogError::TopicMismatch {
                    topic: topic.to_string(),
                    existing: count,
                    requested: partitions,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO topics (topic, partitions) VALUES (?1, ?2)",
                    params![topic, partitions],
                )?;
                log::info!("🔧 Created topic '{}' with {} partitions", topic, partitions);
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            topic: topic.to_string(),
            partitions,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_offset(conn: &Connection, topic: &str, partition: u32) -> Result<u64, LogError> {
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM event_log
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| row.get(0),
        )?;
        Ok(next.max(0) as u64)
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, partition: u32, events: &[TelemetryEvent]) -> Result<u64, LogError> {
        check_partition(partition, self.partitions)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut offset = Self::next_offset(&tx, &self.topic, partition)?;
        let now = chrono::Utc::now().timestamp_millis();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO event_log (topic, partition_id, log_offset, car_number, payload, appended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                let payload = serde_json::to_string(event)?;
                stmt.execute(params![
                    self.topic,
                    partition,
                    offset as i64,
                    event.car_number,
                    payload,
                    now
                ])?;
                offset += 1;
            }
        }

        tx.commit()?;
        Ok(offset)
    }

    async fn fetch(&self, partition: u32, from: u64, max: usize) -> Result<Vec<LogEntry>, LogError> {
        check_partition(partition, self.partitions)?;

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT log_offset, payload FROM event_log
             WHERE topic = ?1 AND partition_id = ?2 AND log_offset >= ?3
             ORDER BY log_offset LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![self.topic, partition, from as i64, max as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (offset, payload) = row?;
            entries.push(LogEntry {
                partition,
                offset: offset as u64,
                event: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), LogError> {
        check_partition(partition, self.partitions)?;

        self.lock().execute(
            "INSERT INTO consumer_offsets (group_id, topic, partition_id, next_offset, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                next_offset = excluded.next_offset,
                updated_at = excluded.updated_at",
            params![
                group,
                self.topic,
                partition,
                next_offset as i64,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    async fn committed(&self, group: &str, partition: u32) -> Result<u64, LogError> {
        check_partition(partition, self.partitions)?;

        let offset: Option<i64> = self
            .lock()
            .query_row(
                "SELECT next_offset FROM consumer_offsets
                 WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
                params![group, self.topic, partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0).max(0) as u64)
    }

    async fn end_offset(&self, partition: u32) -> Result<u64, LogError> {
        check_partition(partition, self.partitions)?;
        Self::next_offset(&self.lock(), &self.topic, partition)
    }
}
