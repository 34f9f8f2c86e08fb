//! Per-session current state: latest value per (car, metric)
//!
//! Merge rule: an observation replaces the stored one only when its
//! `timestampMonotonic` is strictly greater. Applying the same set of events in
//! any order, any number of times, yields the same state.

use super::types::{StateKey, TelemetryEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub value: String,
    pub timestamp_monotonic: u64,
    pub event_time_utc: DateTime<Utc>,
}

/// Flattened state row, used for persistence and query responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStateRecord {
    pub session_id: String,
    pub car_number: String,
    pub metric_name: String,
    pub value: String,
    pub timestamp_monotonic: u64,
    pub event_time_utc: DateTime<Utc>,
}

impl CurrentStateRecord {
    pub fn key(&self) -> StateKey {
        StateKey::new(self.car_number.clone(), self.metric_name.clone())
    }

    pub fn entry(&self) -> StateEntry {
        StateEntry {
            value: self.value.clone(),
            timestamp_monotonic: self.timestamp_monotonic,
            event_time_utc: self.event_time_utc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Stored entry is as new or newer; nothing changed
    Stale { stored: u64 },
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Stale { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    entries: BTreeMap<StateKey, StateEntry>,
}

impl CurrentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, event: &TelemetryEvent) -> MergeOutcome {
        self.merge_entry(
            event.key(),
            StateEntry {
                value: event.value.clone(),
                timestamp_monotonic: event.timestamp_monotonic,
                event_time_utc: event.event_time_utc,
            },
        )
    }

    /// Same rule as [`merge`](Self::merge), for entries restored from storage.
    pub fn merge_entry(&mut self, key: StateKey, entry: StateEntry) -> MergeOutcome {
        match self.entries.get_mut(&key) {
            Some(stored) if entry.timestamp_monotonic > stored.timestamp_monotonic => {
                *stored = entry;
                MergeOutcome::Updated
            }
            Some(stored) => MergeOutcome::Stale {
                stored: stored.timestamp_monotonic,
            },
            None => {
                self.entries.insert(key, entry);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn get(&self, car_number: &str, metric_name: &str) -> Option<&StateEntry> {
        self.entries.get(&StateKey::new(car_number, metric_name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<StateKey, StateEntry> {
        &self.entries
    }

    pub fn record(&self, session_id: &str, key: &StateKey) -> Option<CurrentStateRecord> {
        self.entries.get(key).map(|entry| CurrentStateRecord {
            session_id: session_id.to_string(),
            car_number: key.car_number.clone(),
            metric_name: key.metric_name.clone(),
            value: entry.value.clone(),
            timestamp_monotonic: entry.timestamp_monotonic,
            event_time_utc: entry.event_time_utc,
        })
    }
}
