//! State/aggregate store writer
//!
//! Tables (see `admin::schema`):
//! - `current_state` - UPSERT guarded by `timestamp_monotonic`
//! - `window_aggregates` - UPSERT on the window key; finalized rows are frozen.
//!   Open rows carry their folded timestamps (`folded_ts`, JSON array) so a
//!   restarted worker can resume them without double counting
//! - `sessions` - lifecycle status per session, restored on start
//!
//! [`SqliteArchiveReader`] is the query side: its own read-only connection,
//! driven through `spawn_blocking` so archive reads never stall the runtime
//! or wait on the writer's lock.

use super::session::{SessionStatus, SessionView};
use super::state::CurrentStateRecord;
use super::windows::WindowAggregateRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Trait for writing state and window aggregates to the store
#[async_trait]
pub trait AggregateDbWriter: Send + Sync {
    /// Operation: UPSERT (INSERT ... ON CONFLICT DO UPDATE ... WHERE newer)
    ///
    /// A row is only replaced by a strictly greater `timestamp_monotonic`,
    /// mirroring the in-memory merge rule, so replays and out-of-order
    /// flushes cannot regress stored state.
    async fn write_state(&self, records: Vec<CurrentStateRecord>) -> Result<(), DbError>;

    /// Operation: UPSERT on (session, window, car, metric)
    ///
    /// Once a row is written with `finalized = 1` later writes are ignored.
    async fn write_windows(&self, records: Vec<WindowAggregateRecord>) -> Result<(), DbError>;

    /// Operation: UPSERT on session id
    async fn write_sessions(&self, sessions: Vec<SessionView>) -> Result<(), DbError>;

    /// CurrentState rows of sessions that are not archived, used to seed
    /// workers on restart.
    async fn load_state(&self) -> Result<Vec<CurrentStateRecord>, DbError>;

    /// Window rows (open with folded timestamps, and finalized) of sessions
    /// that are not archived.
    async fn load_windows(&self) -> Result<Vec<WindowAggregateRecord>, DbError>;

    /// Every persisted session status, archived ones included.
    async fn load_sessions(&self) -> Result<Vec<SessionView>, DbError>;

    /// Whether `name` exists as a table in the store being written.
    async fn has_table(&self, name: &str) -> Result<bool, DbError>;
}

/// SQLite implementation of AggregateDbWriter.
pub struct SqliteAggregateWriter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAggregateWriter {
    /// Open the store.
    ///
    /// Note: does NOT create the schema. Tables are provisioned through
    /// `admin::SchemaProvisioner` before ingestion starts.
    pub fn new(db_path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// CurrentState rows of every non-archived session (restart recovery).
    pub fn load_current_state(&self) -> Result<Vec<CurrentStateRecord>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, car_number, metric_name, value, timestamp_monotonic, event_time_utc
             FROM current_state
             WHERE session_id NOT IN (SELECT session_id FROM sessions WHERE archived = 1)
             ORDER BY session_id, car_number, metric_name",
        )?;
        let rows = stmt.query_map([], read_state_row)?;
        collect_rows(rows)
    }

    /// Window rows of every non-archived session (restart recovery).
    pub fn load_window_rows(&self) -> Result<Vec<WindowAggregateRecord>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, window_start_ms, window_end_ms, car_number, metric_name,
                    sample_count, value_sum, value_min, value_max, finalized, folded_ts
             FROM window_aggregates
             WHERE session_id NOT IN (SELECT session_id FROM sessions WHERE archived = 1)
             ORDER BY session_id, window_start_ms, car_number, metric_name",
        )?;
        let rows = stmt.query_map([], |row| Ok((read_window_row(row)?, row.get::<_, String>(10)?)))?;

        let mut records = Vec::new();
        for row in rows {
            let (mut record, folded) = row?;
            record.folded_timestamps =
                serde_json::from_str(&folded).map_err(|e| DbError::CorruptRow {
                    table: "window_aggregates",
                    detail: format!("folded_ts '{}': {}", folded, e),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn stored_sessions(&self) -> Result<Vec<SessionView>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, status, finalize_deadline_ms, closed_at_ms, archived
             FROM sessions ORDER BY session_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, i64>(4)? != 0,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, status, finalize_deadline_ms, closed_at_ms, archived) = row?;
            let status = SessionStatus::parse(&status).ok_or_else(|| DbError::CorruptRow {
                table: "sessions",
                detail: format!("status '{}' of session {}", status, session_id),
            })?;
            sessions.push(SessionView {
                session_id,
                status,
                watermark_ms: None,
                finalize_deadline_ms,
                closed_at_ms,
                archived,
            });
        }
        Ok(sessions)
    }

    pub fn session_state(&self, session_id: &str) -> Result<Vec<CurrentStateRecord>, DbError> {
        query_session_state(&self.lock(), session_id)
    }

    pub fn session_windows(
        &self,
        session_id: &str,
        car_number: Option<&str>,
    ) -> Result<Vec<WindowAggregateRecord>, DbError> {
        query_session_windows(&self.lock(), session_id, car_number)
    }

    /// Distinct session ids present in the store.
    pub fn session_ids(&self) -> Result<Vec<String>, DbError> {
        query_session_ids(&self.lock())
    }
}

/// Read-only access to the store for sessions evicted from memory.
///
/// Holds a separate connection opened `SQLITE_OPEN_READ_ONLY`; WAL lets it
/// read while the writer commits.
pub struct SqliteArchiveReader {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteArchiveReader {
    pub fn open(db_path: &str) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, query: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            query(&*conn)
        })
        .await?
    }

    pub async fn session_state(&self, session_id: &str) -> Result<Vec<CurrentStateRecord>, DbError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| query_session_state(conn, &session_id))
            .await
    }

    pub async fn session_windows(
        &self,
        session_id: &str,
        car_number: Option<&str>,
    ) -> Result<Vec<WindowAggregateRecord>, DbError> {
        let session_id = session_id.to_string();
        let car_number = car_number.map(str::to_string);
        self.with_conn(move |conn| query_session_windows(conn, &session_id, car_number.as_deref()))
            .await
    }

    pub async fn session_ids(&self) -> Result<Vec<String>, DbError> {
        self.with_conn(query_session_ids).await
    }
}

fn query_session_state(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<CurrentStateRecord>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, car_number, metric_name, value, timestamp_monotonic, event_time_utc
         FROM current_state WHERE session_id = ?1 ORDER BY car_number, metric_name",
    )?;
    let rows = stmt.query_map([session_id], read_state_row)?;
    collect_rows(rows)
}

fn query_session_windows(
    conn: &Connection,
    session_id: &str,
    car_number: Option<&str>,
) -> Result<Vec<WindowAggregateRecord>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, window_start_ms, window_end_ms, car_number, metric_name,
                sample_count, value_sum, value_min, value_max, finalized
         FROM window_aggregates
         WHERE session_id = ?1 AND (?2 IS NULL OR car_number = ?2)
         ORDER BY window_start_ms, car_number, metric_name",
    )?;
    let rows = stmt.query_map(params![session_id, car_number], read_window_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_session_ids(conn: &Connection) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id FROM current_state
         UNION SELECT session_id FROM window_aggregates
         ORDER BY 1",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn read_window_row(row: &Row<'_>) -> rusqlite::Result<WindowAggregateRecord> {
    Ok(WindowAggregateRecord {
        session_id: row.get(0)?,
        window_start_ms: row.get(1)?,
        window_end_ms: row.get(2)?,
        car_number: row.get(3)?,
        metric_name: row.get(4)?,
        count: row.get::<_, i64>(5)?.max(0) as u64,
        sum: row.get(6)?,
        min: row.get(7)?,
        max: row.get(8)?,
        finalized: row.get::<_, i64>(9)? != 0,
        folded_timestamps: Vec::new(),
    })
}

type RawStateRow = (String, String, String, String, i64, String);

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<RawStateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawStateRow>>,
) -> Result<Vec<CurrentStateRecord>, DbError> {
    let mut records = Vec::new();
    for row in rows {
        let (session_id, car_number, metric_name, value, ts, event_time) = row?;
        let event_time_utc = DateTime::parse_from_rfc3339(&event_time)
            .map_err(|e| DbError::CorruptRow {
                table: "current_state",
                detail: format!("event_time_utc '{}': {}", event_time, e),
            })?
            .with_timezone(&Utc);
        records.push(CurrentStateRecord {
            session_id,
            car_number,
            metric_name,
            value,
            timestamp_monotonic: ts.max(0) as u64,
            event_time_utc,
        });
    }
    Ok(records)
}

fn to_sql_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

#[async_trait]
impl AggregateDbWriter for SqliteAggregateWriter {
    async fn load_state(&self) -> Result<Vec<CurrentStateRecord>, DbError> {
        self.load_current_state()
    }

    async fn load_windows(&self) -> Result<Vec<WindowAggregateRecord>, DbError> {
        self.load_window_rows()
    }

    async fn load_sessions(&self) -> Result<Vec<SessionView>, DbError> {
        self.stored_sessions()
    }

    async fn has_table(&self, name: &str) -> Result<bool, DbError> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn write_state(&self, records: Vec<CurrentStateRecord>) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO current_state (
                    session_id, car_number, metric_name, value,
                    timestamp_monotonic, event_time_utc, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(session_id, car_number, metric_name) DO UPDATE SET
                    value = excluded.value,
                    timestamp_monotonic = excluded.timestamp_monotonic,
                    event_time_utc = excluded.event_time_utc,
                    updated_at = excluded.updated_at
                WHERE excluded.timestamp_monotonic > current_state.timestamp_monotonic
                "#,
            )?;
            for record in &records {
                stmt.execute(params![
                    record.session_id,
                    record.car_number,
                    record.metric_name,
                    record.value,
                    to_sql_ts(record.timestamp_monotonic),
                    record.event_time_utc.to_rfc3339(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn write_windows(&self, records: Vec<WindowAggregateRecord>) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO window_aggregates (
                    session_id, window_start_ms, window_end_ms, car_number, metric_name,
                    sample_count, value_sum, value_min, value_max, finalized, folded_ts,
                    updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(session_id, window_start_ms, window_end_ms, car_number, metric_name)
                DO UPDATE SET
                    sample_count = excluded.sample_count,
                    value_sum = excluded.value_sum,
                    value_min = excluded.value_min,
                    value_max = excluded.value_max,
                    finalized = excluded.finalized,
                    folded_ts = excluded.folded_ts,
                    updated_at = excluded.updated_at
                WHERE window_aggregates.finalized = 0
                "#,
            )?;
            for record in &records {
                let folded = serde_json::to_string(&record.folded_timestamps)?;
                stmt.execute(params![
                    record.session_id,
                    record.window_start_ms,
                    record.window_end_ms,
                    record.car_number,
                    record.metric_name,
                    to_sql_ts(record.count),
                    record.sum,
                    record.min,
                    record.max,
                    record.finalized as i64,
                    folded,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn write_sessions(&self, sessions: Vec<SessionView>) -> Result<(), DbError> {
        if sessions.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO sessions (
                    session_id, status, finalize_deadline_ms, closed_at_ms, archived, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(session_id) DO UPDATE SET
                    status = excluded.status,
                    finalize_deadline_ms = excluded.finalize_deadline_ms,
                    closed_at_ms = excluded.closed_at_ms,
                    archived = excluded.archived,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for session in &sessions {
                stmt.execute(params![
                    session.session_id,
                    session.status.as_str(),
                    session.finalize_deadline_ms,
                    session.closed_at_ms,
                    session.archived as i64,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::schema::builtin_definitions;
    use crate::pipeline::types::utc_from_millis;
    use tempfile::NamedTempFile;

    /// Helper to create a test database with the built-in schemas
    fn create_test_db() -> (NamedTempFile, SqliteAggregateWriter) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let conn = Connection::open(db_path).unwrap();
        for def in builtin_definitions() {
            conn.execute_batch(&def.ddl).unwrap();
        }
        drop(conn);

        let writer = SqliteAggregateWriter::new(db_path).unwrap();
        (temp_file, writer)
    }

    fn state(ts: u64, value: &str) -> CurrentStateRecord {
        CurrentStateRecord {
            session_id: "s1".to_string(),
            car_number: "44".to_string(),
            metric_name: "speed".to_string(),
            value: value.to_string(),
            timestamp_monotonic: ts,
            event_time_utc: utc_from_millis(ts as i64),
        }
    }

    fn window(count: u64, finalized: bool) -> WindowAggregateRecord {
        WindowAggregateRecord {
            session_id: "s1".to_string(),
            window_start_ms: 0,
            window_end_ms: 60_000,
            car_number: "44".to_string(),
            metric_name: "speed".to_string(),
            count,
            sum: count as f64 * 10.0,
            min: 10.0,
            max: 10.0,
            finalized,
            folded_timestamps: Vec::new(),
        }
    }

    fn session(id: &str, status: SessionStatus, archived: bool) -> SessionView {
        SessionView {
            session_id: id.to_string(),
            status,
            watermark_ms: None,
            finalize_deadline_ms: None,
            closed_at_ms: (status == SessionStatus::Closed).then_some(5_000),
            archived,
        }
    }

    #[tokio::test]
    async fn test_state_upsert_never_regresses() {
        let (_temp, writer) = create_test_db();

        writer.write_state(vec![state(100, "210")]).await.unwrap();
        writer.write_state(vec![state(80, "205")]).await.unwrap();

        let rows = writer.session_state("s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "210");
        assert_eq!(rows[0].timestamp_monotonic, 100);

        writer.write_state(vec![state(120, "215")]).await.unwrap();
        assert_eq!(writer.load_current_state().unwrap()[0].value, "215");
    }

    #[tokio::test]
    async fn test_finalized_window_is_frozen() {
        let (_temp, writer) = create_test_db();

        writer.write_windows(vec![window(1, false)]).await.unwrap();
        writer.write_windows(vec![window(2, true)]).await.unwrap();
        writer.write_windows(vec![window(3, false)]).await.unwrap();

        let rows = writer.session_windows("s1", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
        assert!(rows[0].finalized);
    }

    #[tokio::test]
    async fn test_window_car_filter_and_session_ids() {
        let (_temp, writer) = create_test_db();
        let mut other = window(1, true);
        other.car_number = "16".to_string();

        writer.write_windows(vec![window(1, true), other]).await.unwrap();
        writer.write_state(vec![state(1, "1")]).await.unwrap();

        assert_eq!(writer.session_windows("s1", Some("16")).unwrap().len(), 1);
        assert_eq!(writer.session_windows("s1", None).unwrap().len(), 2);
        assert_eq!(writer.session_ids().unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_open_rows_reload_with_folded_timestamps() {
        let (_temp, writer) = create_test_db();
        let mut open = window(3, false);
        open.folded_timestamps = vec![1, 2, 3];
        writer.write_windows(vec![open]).await.unwrap();

        let rows = writer.load_windows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[0].folded_timestamps, vec![1, 2, 3]);

        // Finalizing drops the folded set
        writer.write_windows(vec![window(3, true)]).await.unwrap();
        let rows = writer.load_windows().await.unwrap();
        assert!(rows[0].finalized);
        assert!(rows[0].folded_timestamps.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_round_trip_and_archived_are_not_reloaded() {
        let (_temp, writer) = create_test_db();
        let mut gone = state(1, "300");
        gone.session_id = "gone".to_string();
        writer.write_state(vec![state(1, "1"), gone]).await.unwrap();
        let mut gone_window = window(1, true);
        gone_window.session_id = "gone".to_string();
        writer.write_windows(vec![window(1, false), gone_window]).await.unwrap();

        writer
            .write_sessions(vec![
                session("s1", SessionStatus::Active, false),
                session("gone", SessionStatus::Closed, false),
            ])
            .await
            .unwrap();
        writer
            .write_sessions(vec![session("gone", SessionStatus::Closed, true)])
            .await
            .unwrap();

        let sessions = writer.load_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "gone");
        assert_eq!(sessions[0].status, SessionStatus::Closed);
        assert_eq!(sessions[0].closed_at_ms, Some(5_000));
        assert!(sessions[0].archived);
        assert_eq!(sessions[1].status, SessionStatus::Active);

        let state_rows = writer.load_state().await.unwrap();
        assert_eq!(state_rows.len(), 1);
        assert_eq!(state_rows[0].session_id, "s1");
        let window_rows = writer.load_windows().await.unwrap();
        assert_eq!(window_rows.len(), 1);
        assert_eq!(window_rows[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_has_table_checks_the_written_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let writer = SqliteAggregateWriter::new(temp_file.path().to_str().unwrap()).unwrap();
        assert!(!writer.has_table("current_state").await.unwrap());

        let (_temp, provisioned) = create_test_db();
        assert!(provisioned.has_table("current_state").await.unwrap());
        assert!(provisioned.has_table("sessions").await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_reader_sees_writer_commits() {
        let (temp, writer) = create_test_db();
        let reader = SqliteArchiveReader::open(temp.path().to_str().unwrap()).unwrap();
        assert!(reader.session_ids().await.unwrap().is_empty());

        writer.write_state(vec![state(7, "250")]).await.unwrap();
        writer.write_windows(vec![window(2, true)]).await.unwrap();

        assert_eq!(reader.session_ids().await.unwrap(), vec!["s1".to_string()]);
        assert_eq!(reader.session_state("s1").await.unwrap()[0].value, "250");
        assert_eq!(reader.session_windows("s1", Some("44")).await.unwrap()[0].count, 2);
        assert!(reader.session_windows("s1", Some("16")).await.unwrap().is_empty());
    }
}
