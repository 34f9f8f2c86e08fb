//! Read-only access to session state and window aggregates
//!
//! Live sessions are served from one [`StoreView`] per call, so a response
//! never mixes two versions of a partition; status and watermark come from
//! the same slices as the data. Sessions evicted from memory are served from
//! the archive store through its own read-only connection.

use crate::pipeline::db::{DbError, SqliteArchiveReader};
use crate::pipeline::session::{SessionRegistry, SessionStatus};
use crate::pipeline::snapshot::{SnapshotStore, StoreView};
use crate::pipeline::state::{CurrentStateRecord, StateEntry};
use crate::pipeline::windows::WindowAggregateRecord;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("no value for car {car_number} metric {metric_name} in session {session_id}")]
    NotFound {
        session_id: String,
        car_number: String,
        metric_name: String,
    },

    #[error("archive read failed: {0}")]
    Archive(#[from] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DataSource {
    Live,
    Archive,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshotView {
    pub session_id: String,
    pub status: Option<SessionStatus>,
    pub watermark_ms: Option<i64>,
    /// Store version the view was read at (0 for archive reads)
    pub version: u64,
    pub source: DataSource,
    pub current_state: Vec<CurrentStateRecord>,
    pub open_windows: Vec<WindowAggregateRecord>,
    pub closed_windows: Vec<WindowAggregateRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    /// `None` for sessions only known from the archive
    pub status: Option<SessionStatus>,
    pub archived: bool,
    pub watermark_ms: Option<i64>,
}

pub struct QueryGateway {
    snapshots: Arc<SnapshotStore>,
    registry: Arc<SessionRegistry>,
    archive: Option<Arc<SqliteArchiveReader>>,
}

impl QueryGateway {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        registry: Arc<SessionRegistry>,
        archive: Option<Arc<SqliteArchiveReader>>,
    ) -> Self {
        Self {
            snapshots,
            registry,
            archive,
        }
    }

    /// Latest value of one metric for one car.
    pub async fn get_state(
        &self,
        session_id: &str,
        car_number: &str,
        metric_name: &str,
    ) -> Result<CurrentStateRecord, QueryError> {
        let not_found = || QueryError::NotFound {
            session_id: session_id.to_string(),
            car_number: car_number.to_string(),
            metric_name: metric_name.to_string(),
        };

        let view = self.snapshots.load();
        if self.is_live(&view, session_id) {
            return view
                .session_slices(session_id)
                .iter()
                .find_map(|slice| {
                    slice
                        .current_state
                        .iter()
                        .find(|(key, _)| key.car_number == car_number && key.metric_name == metric_name)
                        .map(|(key, entry)| record(session_id, key.car_number.clone(), key.metric_name.clone(), entry))
                })
                .ok_or_else(not_found);
        }

        let rows = self.archived_state(session_id).await?;
        if rows.is_empty() && self.registry.view(session_id).is_none() {
            return Err(QueryError::UnknownSession(session_id.to_string()));
        }
        rows.into_iter()
            .find(|r| r.car_number == car_number && r.metric_name == metric_name)
            .ok_or_else(not_found)
    }

    /// Current state, open and closed windows, status and watermark of one session.
    pub async fn session_snapshot(&self, session_id: &str) -> Result<SessionSnapshotView, QueryError> {
        let view = self.snapshots.load();

        if self.is_live(&view, session_id) {
            let slices = view.session_slices(session_id);
            let mut current_state = Vec::new();
            let mut open_windows = Vec::new();
            let mut closed_windows = Vec::new();

            for slice in &slices {
                current_state.extend(slice.current_state.iter().map(|(key, entry)| {
                    record(session_id, key.car_number.clone(), key.metric_name.clone(), entry)
                }));
                open_windows.extend(slice.open_windows.iter().cloned());
                closed_windows.extend(slice.closed_windows.iter().cloned());
            }

            current_state.sort_by(|a, b| {
                (&a.car_number, &a.metric_name).cmp(&(&b.car_number, &b.metric_name))
            });
            sort_windows(&mut open_windows);
            sort_windows(&mut closed_windows);

            // Least advanced slice: no slice shows windows its status has passed
            return Ok(SessionSnapshotView {
                session_id: session_id.to_string(),
                status: slices.iter().filter_map(|s| s.status).min(),
                watermark_ms: slices.iter().filter_map(|s| s.watermark_ms).min(),
                version: view.version,
                source: DataSource::Live,
                current_state,
                open_windows,
                closed_windows,
            });
        }

        let session = self.registry.view(session_id);
        let current_state = self.archived_state(session_id).await?;
        let windows = self.archived_windows(session_id, None).await?;
        if current_state.is_empty() && windows.is_empty() && session.is_none() {
            return Err(QueryError::UnknownSession(session_id.to_string()));
        }

        let (closed_windows, open_windows) = windows.into_iter().partition(|w| w.finalized);
        Ok(SessionSnapshotView {
            session_id: session_id.to_string(),
            status: session.as_ref().map(|s| s.status),
            watermark_ms: session.as_ref().and_then(|s| s.watermark_ms),
            version: 0,
            source: DataSource::Archive,
            current_state,
            open_windows,
            closed_windows,
        })
    }

    /// Window aggregates of one session (open and closed), optionally for one car.
    pub async fn window_aggregates(
        &self,
        session_id: &str,
        car_number: Option<&str>,
    ) -> Result<Vec<WindowAggregateRecord>, QueryError> {
        let view = self.snapshots.load();

        if self.is_live(&view, session_id) {
            let mut windows: Vec<_> = view
                .session_slices(session_id)
                .iter()
                .flat_map(|slice| slice.closed_windows.iter().chain(slice.open_windows.iter()))
                .filter(|w| car_number.map_or(true, |car| w.car_number == car))
                .cloned()
                .collect();
            sort_windows(&mut windows);
            return Ok(windows);
        }

        let windows = self.archived_windows(session_id, car_number).await?;
        if windows.is_empty()
            && self.registry.view(session_id).is_none()
            && self.archived_state(session_id).await?.is_empty()
        {
            return Err(QueryError::UnknownSession(session_id.to_string()));
        }
        Ok(windows)
    }

    /// Known session ids with their status (metadata only).
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, QueryError> {
        let mut summaries: Vec<SessionSummary> = self
            .registry
            .views()
            .into_iter()
            .map(|v| SessionSummary {
                session_id: v.session_id,
                status: Some(v.status),
                archived: v.archived,
                watermark_ms: v.watermark_ms,
            })
            .collect();

        if let Some(archive) = &self.archive {
            let known: BTreeSet<String> = summaries.iter().map(|s| s.session_id.clone()).collect();
            for session_id in archive.session_ids().await? {
                if !known.contains(&session_id) {
                    summaries.push(SessionSummary {
                        session_id,
                        status: None,
                        archived: true,
                        watermark_ms: None,
                    });
                }
            }
        }

        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    /// In memory and not yet archived.
    fn is_live(&self, view: &StoreView, session_id: &str) -> bool {
        let archived = self
            .registry
            .view(session_id)
            .map_or(false, |s| s.archived);
        !archived && view.contains_session(session_id)
    }

    async fn archived_state(&self, session_id: &str) -> Result<Vec<CurrentStateRecord>, QueryError> {
        match &self.archive {
            Some(archive) => Ok(archive.session_state(session_id).await?),
            None => Ok(Vec::new()),
        }
    }

    async fn archived_windows(
        &self,
        session_id: &str,
        car_number: Option<&str>,
    ) -> Result<Vec<WindowAggregateRecord>, QueryError> {
        match &self.archive {
            Some(archive) => Ok(archive.session_windows(session_id, car_number).await?),
            None => Ok(Vec::new()),
        }
    }
}

fn record(
    session_id: &str,
    car_number: String,
    metric_name: String,
    entry: &StateEntry,
) -> CurrentStateRecord {
    CurrentStateRecord {
        session_id: session_id.to_string(),
        car_number,
        metric_name,
        value: entry.value.clone(),
        timestamp_monotonic: entry.timestamp_monotonic,
        event_time_utc: entry.event_time_utc,
    }
}

fn sort_windows(windows: &mut [WindowAggregateRecord]) {
    windows.sort_by(|a, b| {
        (a.window_start_ms, a.window_end_ms, &a.car_number, &a.metric_name)
            .cmp(&(b.window_start_ms, b.window_end_ms, &b.car_number, &b.metric_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::schema::builtin_definitions;
    use crate::pipeline::db::{AggregateDbWriter, SqliteAggregateWriter};
    use crate::pipeline::snapshot::{PartitionSnapshot, SessionSnapshot};
    use crate::pipeline::types::{utc_from_millis, StateKey};
    use std::collections::{BTreeMap, HashMap};
    use tempfile::TempDir;

    fn entry(value: &str, ts: u64) -> StateEntry {
        StateEntry {
            value: value.to_string(),
            timestamp_monotonic: ts,
            event_time_utc: utc_from_millis(ts as i64),
        }
    }

    fn window(session: &str, start: i64, car: &str, finalized: bool) -> WindowAggregateRecord {
        WindowAggregateRecord {
            session_id: session.to_string(),
            window_start_ms: start,
            window_end_ms: start + 60_000,
            car_number: car.to_string(),
            metric_name: "speed".to_string(),
            count: 1,
            sum: 200.0,
            min: 200.0,
            max: 200.0,
            finalized,
            folded_timestamps: Vec::new(),
        }
    }

    fn publish(store: &SnapshotStore, partition: u32, session: &str, car: &str, value: &str) {
        publish_at(store, partition, session, car, value, SessionStatus::Active, 55_000);
    }

    fn publish_at(
        store: &SnapshotStore,
        partition: u32,
        session: &str,
        car: &str,
        value: &str,
        status: SessionStatus,
        watermark_ms: i64,
    ) {
        let mut current_state = BTreeMap::new();
        current_state.insert(StateKey::new(car, "speed"), entry(value, 100));
        let slice = SessionSnapshot {
            session_id: session.to_string(),
            partition,
            current_state,
            open_windows: vec![window(session, 60_000, car, false)],
            closed_windows: vec![window(session, 0, car, true)],
            status: Some(status),
            watermark_ms: Some(watermark_ms),
        };
        store.publish(PartitionSnapshot {
            partition,
            version: 1,
            sessions: HashMap::from([(session.to_string(), Arc::new(slice))]),
        });
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(5_000, 300_000, 10_000, 3_600_000))
    }

    #[tokio::test]
    async fn test_live_queries_merge_partitions() {
        let store = Arc::new(SnapshotStore::new(2));
        let registry = registry();
        registry.observe("s1", 0, 0);
        publish(&store, 0, "s1", "44", "210");
        publish(&store, 1, "s1", "16", "198");

        let gateway = QueryGateway::new(store, registry, None);

        assert_eq!(gateway.get_state("s1", "44", "speed").await.unwrap().value, "210");
        assert!(matches!(
            gateway.get_state("s1", "44", "rpm").await,
            Err(QueryError::NotFound { .. })
        ));

        let snapshot = gateway.session_snapshot("s1").await.unwrap();
        assert_eq!(snapshot.source, DataSource::Live);
        assert_eq!(snapshot.status, Some(SessionStatus::Active));
        assert_eq!(snapshot.watermark_ms, Some(55_000));
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.current_state.len(), 2);
        assert_eq!(snapshot.current_state[0].car_number, "16");
        assert_eq!(snapshot.open_windows.len(), 2);
        assert_eq!(snapshot.closed_windows.len(), 2);

        let windows = gateway.window_aggregates("s1", Some("44")).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window_start_ms, 0);
        assert!(windows.iter().all(|w| w.car_number == "44"));

        assert!(matches!(
            gateway.session_snapshot("nope").await,
            Err(QueryError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_status_comes_from_the_slices_read() {
        let store = Arc::new(SnapshotStore::new(2));
        let registry = registry();
        registry.observe("s1", 0, 0);
        publish_at(&store, 0, "s1", "44", "210", SessionStatus::Finalizing, 61_000);
        publish_at(&store, 1, "s1", "16", "198", SessionStatus::Active, 58_000);

        // The registry has moved on; the response must not mix it in
        registry.end_session("s1", 10);
        registry.acknowledge_flush("s1", 0, 20).unwrap();
        assert_eq!(registry.view("s1").unwrap().status, SessionStatus::Closed);

        let gateway = QueryGateway::new(store, registry, None);
        let snapshot = gateway.session_snapshot("s1").await.unwrap();
        assert_eq!(snapshot.status, Some(SessionStatus::Active));
        assert_eq!(snapshot.watermark_ms, Some(58_000));
        assert_eq!(snapshot.open_windows.len(), 2);
    }

    #[tokio::test]
    async fn test_evicted_session_served_from_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pitwall.db");
        let writer = SqliteAggregateWriter::new(path.to_str().unwrap()).unwrap();
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            for def in builtin_definitions() {
                conn.execute_batch(&def.ddl).unwrap();
            }
        }

        writer
            .write_state(vec![CurrentStateRecord {
                session_id: "old".to_string(),
                car_number: "44".to_string(),
                metric_name: "speed".to_string(),
                value: "305".to_string(),
                timestamp_monotonic: 9,
                event_time_utc: utc_from_millis(9),
            }])
            .await
            .unwrap();
        writer
            .write_windows(vec![window("old", 0, "44", true), window("old", 0, "1", true)])
            .await
            .unwrap();

        let archive = Arc::new(SqliteArchiveReader::open(path.to_str().unwrap()).unwrap());
        let gateway = QueryGateway::new(Arc::new(SnapshotStore::new(1)), registry(), Some(archive));

        assert_eq!(gateway.get_state("old", "44", "speed").await.unwrap().value, "305");

        let snapshot = gateway.session_snapshot("old").await.unwrap();
        assert_eq!(snapshot.source, DataSource::Archive);
        assert_eq!(snapshot.status, None);
        assert_eq!(snapshot.closed_windows.len(), 2);
        assert!(snapshot.open_windows.is_empty());

        assert_eq!(gateway.window_aggregates("old", Some("1")).await.unwrap().len(), 1);

        let sessions = gateway.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].archived);
        assert!(matches!(
            gateway.window_aggregates("missing", None).await,
            Err(QueryError::UnknownSession(_))
        ));
    }
}
