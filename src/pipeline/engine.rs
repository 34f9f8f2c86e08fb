//! Partition engine: the state owned by one ingestion worker
//!
//! ## Architecture
//!
//! ```text
//! LogEntry (partition p)
//!     ↓
//! PartitionEngine::apply()         merge CurrentState, fold open windows
//!     ↓
//! PartitionEngine::sync_sessions() publish watermark, close / flush windows
//!     ↓
//! build_snapshot() → SnapshotStore
//! take_pending()   → AggregateDbWriter
//! ```
//!
//! Every `(session, car, metric)` key hashes to exactly one partition, so the
//! engine mutates its state without cross-partition locking. Only the session
//! registry is shared.

use super::metrics::IngestMetrics;
use super::session::{Admission, SessionRegistry, SessionStatus};
use super::snapshot::{PartitionSnapshot, SessionSnapshot};
use super::state::{CurrentState, CurrentStateRecord, MergeOutcome};
use super::types::{StateKey, TelemetryEvent};
use super::windows::{SessionWindows, WindowAdmission, WindowAggregateRecord, WindowSpec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug)]
struct SessionSlice {
    state: CurrentState,
    windows: SessionWindows,
    max_event_ms: Option<i64>,
    /// Open windows finalized for FINALIZING/CLOSED
    flushed: bool,
    /// Registry status and watermark last seen by this partition
    status: Option<SessionStatus>,
    watermark_ms: Option<i64>,
}

/// What happened to one consumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        state: MergeOutcome,
        window: Option<WindowAdmission>,
    },
    /// FINALIZING session: state refreshed, aggregates untouched
    StateOnly { state: MergeOutcome },
    Dropped,
}

/// Rows waiting to be written to the state/aggregate store.
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub state: Vec<CurrentStateRecord>,
    pub windows: Vec<WindowAggregateRecord>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.windows.is_empty()
    }
}

pub struct PartitionEngine {
    partition: u32,
    spec: WindowSpec,
    allowed_lateness_ms: i64,
    aggregate_metrics: HashSet<String>,
    sessions: HashMap<String, SessionSlice>,

    /// Sessions whose snapshot must be rebuilt
    dirty: HashSet<String>,
    snapshot_stale: bool,
    published: HashMap<String, Arc<SessionSnapshot>>,
    version: u64,

    pending_state: HashMap<(String, StateKey), CurrentStateRecord>,
    pending_windows: Vec<WindowAggregateRecord>,
    /// Sessions flushed for FINALIZING, acknowledged once persisted
    pending_acks: Vec<String>,

    metrics: Arc<IngestMetrics>,
}

impl PartitionEngine {
    pub fn new(
        partition: u32,
        spec: WindowSpec,
        allowed_lateness_ms: i64,
        aggregate_metrics: &[String],
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            partition,
            spec,
            allowed_lateness_ms,
            aggregate_metrics: aggregate_metrics.iter().cloned().collect(),
            sessions: HashMap::new(),
            dirty: HashSet::new(),
            snapshot_stale: false,
            published: HashMap::new(),
            version: 0,
            pending_state: HashMap::new(),
            pending_windows: Vec::new(),
            pending_acks: Vec::new(),
            metrics,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    fn slice(&mut self, session_id: &str) -> &mut SessionSlice {
        let spec = self.spec;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionSlice {
                state: CurrentState::new(),
                windows: SessionWindows::new(session_id, spec),
                max_event_ms: None,
                flushed: false,
                status: None,
                watermark_ms: None,
            })
    }

    /// Apply one consumed event under the session's current admission.
    pub fn apply(&mut self, event: &TelemetryEvent, admission: Admission) -> ApplyOutcome {
        if admission == Admission::Drop {
            IngestMetrics::incr(&self.metrics.dropped_after_close);
            log::debug!(
                "Dropping event for closed session {} (car {}, {})",
                event.session_id,
                event.car_number,
                event.metric_name
            );
            return ApplyOutcome::Dropped;
        }

        let lateness = self.allowed_lateness_ms;
        let aggregated = self.aggregate_metrics.contains(&event.metric_name);
        let metrics = self.metrics.clone();
        let slice = self.slice(&event.session_id);

        let state = slice.state.merge(event);
        let state_record = state
            .changed()
            .then(|| slice.state.record(&event.session_id, &event.key()))
            .flatten();

        if admission == Admission::StateOnly {
            IngestMetrics::incr(&metrics.late_events);
            self.record_state(state, state_record);
            self.dirty.insert(event.session_id.clone());
            return ApplyOutcome::StateOnly { state };
        }

        let event_ms = event.event_time_ms();
        let window = match event.numeric_value() {
            Some(value) if aggregated => {
                let admission = slice.windows.admit(
                    &event.key(),
                    event.timestamp_monotonic,
                    event_ms,
                    value,
                );
                match admission {
                    WindowAdmission::Admitted(_) => IngestMetrics::incr(&metrics.window_updates),
                    WindowAdmission::Duplicate => IngestMetrics::incr(&metrics.window_duplicates),
                    WindowAdmission::Late => {
                        IngestMetrics::incr(&metrics.late_events);
                        log::debug!(
                            "Late event excluded from aggregates: session {} car {} {} at {}ms",
                            event.session_id,
                            event.car_number,
                            event.metric_name,
                            event_ms
                        );
                    }
                }
                Some(admission)
            }
            _ => {
                if slice.windows.is_late(event_ms) {
                    IngestMetrics::incr(&metrics.late_events);
                    log::debug!(
                        "Late event behind closed windows: session {} car {} {} at {}ms",
                        event.session_id,
                        event.car_number,
                        event.metric_name,
                        event_ms
                    );
                }
                None
            }
        };

        // Local watermark: never ahead of the session-wide one
        slice.max_event_ms = Some(slice.max_event_ms.map_or(event_ms, |m| m.max(event_ms)));
        let closed = match slice.max_event_ms {
            Some(max) => slice.windows.advance_to(max - lateness),
            None => Vec::new(),
        };

        self.record_closed(closed);
        self.record_state(state, state_record);
        self.dirty.insert(event.session_id.clone());
        ApplyOutcome::Applied { state, window }
    }

    fn record_state(&mut self, outcome: MergeOutcome, record: Option<CurrentStateRecord>) {
        match (outcome, record) {
            (MergeOutcome::Stale { .. }, _) => IngestMetrics::incr(&self.metrics.merge_conflicts),
            (_, Some(record)) => {
                IngestMetrics::incr(&self.metrics.state_updates);
                self.pending_state
                    .insert((record.session_id.clone(), record.key()), record);
            }
            (_, None) => {}
        }
    }

    fn record_closed(&mut self, closed: Vec<WindowAggregateRecord>) {
        if closed.is_empty() {
            return;
        }
        IngestMetrics::add(&self.metrics.windows_closed, closed.len() as u64);
        self.pending_windows.extend(closed);
    }

    /// Exchange watermarks with the registry and react to session status.
    ///
    /// ACTIVE sessions close windows against the session-wide watermark;
    /// FINALIZING sessions get all open windows flushed once (acknowledged after
    /// the flush is persisted); CLOSED sessions are force-flushed; archived
    /// sessions are evicted from memory.
    pub fn sync_sessions(&mut self, registry: &SessionRegistry) {
        let mut evicted = Vec::new();
        let mut closed_records = Vec::new();

        for (session_id, slice) in self.sessions.iter_mut() {
            let Some(view) = registry.publish_watermark(session_id, self.partition, slice.max_event_ms)
            else {
                continue;
            };

            if view.archived {
                evicted.push(session_id.clone());
                continue;
            }

            if slice.status != Some(view.status) || slice.watermark_ms != view.watermark_ms {
                slice.status = Some(view.status);
                slice.watermark_ms = view.watermark_ms;
                self.dirty.insert(session_id.clone());
            }

            let closed = match view.status {
                SessionStatus::Created | SessionStatus::Active => view
                    .watermark_ms
                    .map(|wm| slice.windows.advance_to(wm))
                    .unwrap_or_default(),
                SessionStatus::Finalizing | SessionStatus::Closed if !slice.flushed => {
                    slice.flushed = true;
                    if view.status == SessionStatus::Finalizing {
                        self.pending_acks.push(session_id.clone());
                    }
                    log::info!(
                        "🧹 Partition {} flushing {} open windows for session {} ({})",
                        self.partition,
                        slice.windows.open_window_count(),
                        session_id,
                        view.status.as_str()
                    );
                    slice.windows.flush_all()
                }
                _ => Vec::new(),
            };

            if !closed.is_empty() {
                self.dirty.insert(session_id.clone());
                closed_records.extend(closed);
            }
        }

        self.record_closed(closed_records);

        for session_id in evicted {
            self.sessions.remove(&session_id);
            self.published.remove(&session_id);
            self.dirty.remove(&session_id);
            self.snapshot_stale = true;
            IngestMetrics::incr(&self.metrics.sessions_evicted);
            log::info!("📦 Partition {} evicted session {}", self.partition, session_id);
        }
    }

    /// Rebuild snapshots of changed sessions; `None` when nothing changed.
    pub fn build_snapshot(&mut self) -> Option<PartitionSnapshot> {
        if self.dirty.is_empty() && !self.snapshot_stale {
            return None;
        }

        for session_id in self.dirty.drain() {
            if let Some(slice) = self.sessions.get(&session_id) {
                let snapshot = SessionSnapshot {
                    session_id: session_id.clone(),
                    partition: self.partition,
                    current_state: slice.state.entries().clone(),
                    open_windows: slice.windows.open_records(),
                    closed_windows: slice.windows.closed_records().to_vec(),
                    status: slice.status,
                    watermark_ms: slice.watermark_ms,
                };
                self.published.insert(session_id, Arc::new(snapshot));
            }
        }

        self.snapshot_stale = false;
        self.version += 1;
        Some(PartitionSnapshot {
            partition: self.partition,
            version: self.version,
            sessions: self.published.clone(),
        })
    }

    /// Drain rows to persist: changed state, closed windows, touched open windows.
    pub fn take_pending(&mut self) -> PendingWrites {
        let mut windows = std::mem::take(&mut self.pending_windows);
        for slice in self.sessions.values_mut() {
            windows.extend(slice.windows.drain_dirty());
        }

        let mut state: Vec<_> = self.pending_state.drain().map(|(_, r)| r).collect();
        state.sort_by(|a, b| {
            (&a.session_id, &a.car_number, &a.metric_name)
                .cmp(&(&b.session_id, &b.car_number, &b.metric_name))
        });

        PendingWrites { state, windows }
    }

    /// Put back rows whose write failed so the next flush retries them.
    pub fn restore_pending(&mut self, pending: PendingWrites) {
        for record in pending.state {
            let key = (record.session_id.clone(), record.key());
            match self.pending_state.get(&key) {
                Some(newer) if newer.timestamp_monotonic >= record.timestamp_monotonic => {}
                _ => {
                    self.pending_state.insert(key, record);
                }
            }
        }
        let mut windows = pending.windows;
        windows.append(&mut self.pending_windows);
        self.pending_windows = windows;
    }

    pub fn take_pending_acks(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Seed CurrentState from the store after a restart.
    pub fn restore_state(&mut self, records: Vec<CurrentStateRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            let session_id = record.session_id.clone();
            let slice = self.slice(&session_id);
            if slice.state.merge_entry(record.key(), record.entry()).changed() {
                restored += 1;
            }
            self.dirty.insert(session_id);
        }
        restored
    }

    /// Seed open and closed windows from the store after a restart.
    pub fn restore_windows(&mut self, records: Vec<WindowAggregateRecord>) -> usize {
        let restored = records.len();
        for record in records {
            let session_id = record.session_id.clone();
            self.slice(&session_id).windows.restore(&record);
            self.dirty.insert(session_id);
        }
        restored
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn state_of(&self, session_id: &str) -> Option<&CurrentState> {
        self.sessions.get(session_id).map(|s| &s.state)
    }

    pub fn windows_of(&self, session_id: &str) -> Option<&SessionWindows> {
        self.sessions.get(session_id).map(|s| &s.windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::utc_from_millis;

    fn engine() -> PartitionEngine {
        PartitionEngine::new(
            0,
            WindowSpec::tumbling(60_000),
            5_000,
            &["speed".to_string()],
            Arc::new(IngestMetrics::new()),
        )
    }

    fn speed(ts: u64, event_ms: i64, value: &str) -> TelemetryEvent {
        TelemetryEvent::new("s1", "44", "speed", value, ts, utc_from_millis(event_ms))
    }

    #[test]
    fn test_stale_merge_is_counted_not_applied() {
        let mut engine = engine();
        engine.apply(&speed(100, 1_000, "210"), Admission::Accept);
        let outcome = engine.apply(&speed(80, 900, "205"), Admission::Accept);

        assert!(matches!(
            outcome,
            ApplyOutcome::Applied { state: MergeOutcome::Stale { stored: 100 }, .. }
        ));
        assert_eq!(engine.state_of("s1").unwrap().get("44", "speed").unwrap().value, "210");
        assert_eq!(engine.metrics.snapshot().merge_conflicts, 1);
    }

    #[test]
    fn test_replaying_a_batch_changes_nothing() {
        let mut engine = engine();
        let batch = vec![speed(1, 1_000, "200"), speed(2, 2_000, "210"), speed(3, 3_000, "190")];
        batch.iter().for_each(|e| {
            engine.apply(e, Admission::Accept);
        });
        let state = engine.state_of("s1").unwrap().entries().clone();
        let windows = engine.windows_of("s1").unwrap().open_records();

        batch.iter().for_each(|e| {
            engine.apply(e, Admission::Accept);
        });

        assert_eq!(engine.state_of("s1").unwrap().entries(), &state);
        assert_eq!(engine.windows_of("s1").unwrap().open_records(), windows);
        assert_eq!(engine.metrics.snapshot().window_duplicates, 3);
    }

    #[test]
    fn test_non_aggregated_metric_skips_windows() {
        let mut engine = engine();
        let event = TelemetryEvent::new("s1", "44", "position", "1", 1, utc_from_millis(1_000));
        let outcome = engine.apply(&event, Admission::Accept);

        assert!(matches!(outcome, ApplyOutcome::Applied { window: None, .. }));
        assert!(engine.windows_of("s1").unwrap().open_records().is_empty());
    }

    #[test]
    fn test_state_only_and_drop_admissions() {
        let mut engine = engine();
        engine.apply(&speed(1, 1_000, "200"), Admission::Accept);

        let outcome = engine.apply(&speed(2, 2_000, "220"), Admission::StateOnly);
        assert!(matches!(outcome, ApplyOutcome::StateOnly { state: MergeOutcome::Updated }));
        assert_eq!(engine.windows_of("s1").unwrap().open_records()[0].count, 1);

        assert_eq!(engine.apply(&speed(3, 3_000, "230"), Admission::Drop), ApplyOutcome::Dropped);
        assert_eq!(engine.state_of("s1").unwrap().get("44", "speed").unwrap().value, "220");

        let metrics = engine.metrics.snapshot();
        assert_eq!(metrics.late_events, 1);
        assert_eq!(metrics.dropped_after_close, 1);
    }

    #[test]
    fn test_finalizing_flushes_once_and_acks_after_persist() {
        let registry = SessionRegistry::new(5_000, 300_000, 10_000, 3_600_000);
        let mut engine = engine();

        registry.observe("s1", 0, 0);
        engine.apply(&speed(1, 1_000, "200"), Admission::Accept);
        registry.end_session("s1", 10);

        engine.sync_sessions(&registry);
        let pending = engine.take_pending();
        assert_eq!(pending.windows.len(), 1);
        assert!(pending.windows[0].finalized);
        assert_eq!(engine.take_pending_acks(), vec!["s1".to_string()]);

        engine.sync_sessions(&registry);
        assert!(engine.take_pending_acks().is_empty());
    }

    #[test]
    fn test_pending_state_coalesces_per_key() {
        let mut engine = engine();
        engine.apply(&speed(1, 1_000, "200"), Admission::Accept);
        engine.apply(&speed(2, 2_000, "210"), Admission::Accept);

        let pending = engine.take_pending();
        assert_eq!(pending.state.len(), 1);
        assert_eq!(pending.state[0].value, "210");
        assert_eq!(pending.windows.len(), 1);
        assert!(!pending.windows[0].finalized);

        engine.restore_pending(pending);
        assert_eq!(engine.take_pending().state.len(), 1);
    }

    #[test]
    fn test_snapshot_only_when_changed() {
        let mut engine = engine();
        assert!(engine.build_snapshot().is_none());

        engine.apply(&speed(1, 1_000, "200"), Admission::Accept);
        let snapshot = engine.build_snapshot().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.sessions["s1"].current_state.len(), 1);

        assert!(engine.build_snapshot().is_none());
    }

    #[test]
    fn test_late_counted_for_every_metric_behind_closed_windows() {
        let mut engine = engine();
        engine.apply(&speed(1, 1_000, "200"), Admission::Accept);
        // Watermark 61s closes [0,60)
        engine.apply(&speed(2, 66_000, "210"), Admission::Accept);
        assert_eq!(engine.metrics.snapshot().late_events, 0);

        let position = TelemetryEvent::new("s1", "44", "position", "3", 3, utc_from_millis(10_000));
        let outcome = engine.apply(&position, Admission::Accept);
        assert!(matches!(outcome, ApplyOutcome::Applied { window: None, .. }));

        let flag = TelemetryEvent::new("s1", "44", "speed", "pit", 4, utc_from_millis(20_000));
        engine.apply(&flag, Admission::Accept);

        // In-range events of other metrics are not late
        let fresh = TelemetryEvent::new("s1", "44", "position", "2", 5, utc_from_millis(64_000));
        engine.apply(&fresh, Admission::Accept);

        assert_eq!(engine.metrics.snapshot().late_events, 2);
        // State still takes the newest value
        assert_eq!(engine.state_of("s1").unwrap().get("44", "position").unwrap().value, "2");
    }

    #[test]
    fn test_snapshot_carries_status_and_watermark() {
        let registry = SessionRegistry::new(5_000, 300_000, 10_000, 3_600_000);
        let mut engine = engine();
        registry.observe("s1", 0, 0);
        engine.apply(&speed(1, 61_000, "200"), Admission::Accept);
        engine.sync_sessions(&registry);

        let snapshot = engine.build_snapshot().unwrap();
        assert_eq!(snapshot.sessions["s1"].status, Some(SessionStatus::Active));
        assert_eq!(snapshot.sessions["s1"].watermark_ms, Some(56_000));

        // A status change alone republishes the slice
        registry.end_session("s1", 10);
        engine.sync_sessions(&registry);
        let snapshot = engine.build_snapshot().unwrap();
        assert_eq!(snapshot.sessions["s1"].status, Some(SessionStatus::Finalizing));
        assert!(snapshot.sessions["s1"].open_windows.is_empty());
    }

    #[test]
    fn test_restored_windows_resume_counting() {
        let mut first = engine();
        for (ts, ms) in [(1, 1_000), (2, 2_000), (3, 3_000)] {
            first.apply(&speed(ts, ms, "200"), Admission::Accept);
        }
        let persisted = first.take_pending().windows;

        let mut second = engine();
        assert_eq!(second.restore_windows(persisted), 1);
        second.apply(&speed(3, 3_000, "200"), Admission::Accept);
        second.apply(&speed(4, 4_000, "200"), Admission::Accept);

        let open = second.windows_of("s1").unwrap().open_records();
        assert_eq!(open[0].count, 4);
        assert_eq!(second.metrics.snapshot().window_duplicates, 1);
    }
}
