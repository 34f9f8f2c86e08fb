//! Ingestion counters shared by all partition workers

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub events_consumed: AtomicU64,
    pub state_updates: AtomicU64,
    /// Stale or duplicate merges (not errors)
    pub merge_conflicts: AtomicU64,
    pub window_updates: AtomicU64,
    pub window_duplicates: AtomicU64,
    /// Events excluded from aggregates for falling into closed windows
    pub late_events: AtomicU64,
    /// Events for CLOSED sessions or past the grace deadline
    pub dropped_after_close: AtomicU64,
    pub windows_closed: AtomicU64,
    pub batches: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub persist_failures: AtomicU64,
    pub commit_failures: AtomicU64,
    pub sessions_evicted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMetricsSnapshot {
    pub events_consumed: u64,
    pub state_updates: u64,
    pub merge_conflicts: u64,
    pub window_updates: u64,
    pub window_duplicates: u64,
    pub late_events: u64,
    pub dropped_after_close: u64,
    pub windows_closed: u64,
    pub batches: u64,
    pub fetch_failures: u64,
    pub persist_failures: u64,
    pub commit_failures: u64,
    pub sessions_evicted: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestMetricsSnapshot {
            events_consumed: load(&self.events_consumed),
            state_updates: load(&self.state_updates),
            merge_conflicts: load(&self.merge_conflicts),
            window_updates: load(&self.window_updates),
            window_duplicates: load(&self.window_duplicates),
            late_events: load(&self.late_events),
            dropped_after_close: load(&self.dropped_after_close),
            windows_closed: load(&self.windows_closed),
            batches: load(&self.batches),
            fetch_failures: load(&self.fetch_failures),
            persist_failures: load(&self.persist_failures),
            commit_failures: load(&self.commit_failures),
            sessions_evicted: load(&self.sessions_evicted),
        }
    }
}
