//! Copy-on-write snapshot store between partition workers and readers
//!
//! Each worker publishes an immutable [`PartitionSnapshot`] after every batch.
//! Publishing swaps in a new [`StoreView`] under a short write lock; readers
//! clone the current `Arc<StoreView>` and never see a half-applied batch.

use super::session::SessionStatus;
use super::state::StateEntry;
use super::types::StateKey;
use super::windows::WindowAggregateRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of one session's slice owned by one partition.
///
/// `status` and `watermark_ms` are the registry values the partition acted on
/// when it built the slice, so they always agree with its windows.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub partition: u32,
    pub current_state: BTreeMap<StateKey, StateEntry>,
    pub open_windows: Vec<WindowAggregateRecord>,
    pub closed_windows: Vec<WindowAggregateRecord>,
    pub status: Option<SessionStatus>,
    pub watermark_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionSnapshot {
    pub partition: u32,
    /// Batches published by this partition
    pub version: u64,
    pub sessions: HashMap<String, Arc<SessionSnapshot>>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreView {
    /// Incremented on every publish, across all partitions
    pub version: u64,
    pub partitions: Vec<Arc<PartitionSnapshot>>,
}

impl StoreView {
    /// Slices of `session_id` from every partition holding it.
    pub fn session_slices(&self, session_id: &str) -> Vec<Arc<SessionSnapshot>> {
        self.partitions
            .iter()
            .filter_map(|p| p.sessions.get(session_id).cloned())
            .collect()
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.partitions
            .iter()
            .any(|p| p.sessions.contains_key(session_id))
    }
}

pub struct SnapshotStore {
    current: RwLock<Arc<StoreView>>,
}

impl SnapshotStore {
    pub fn new(partitions: u32) -> Self {
        let view = StoreView {
            version: 0,
            partitions: (0..partitions)
                .map(|partition| {
                    Arc::new(PartitionSnapshot {
                        partition,
                        ..Default::default()
                    })
                })
                .collect(),
        };
        Self {
            current: RwLock::new(Arc::new(view)),
        }
    }

    /// Current consistent view.
    pub fn load(&self) -> Arc<StoreView> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace one partition's snapshot and bump the store version.
    pub fn publish(&self, snapshot: PartitionSnapshot) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut partitions = guard.partitions.clone();
        let index = snapshot.partition as usize;
        if index >= partitions.len() {
            partitions.resize_with(index + 1, || Arc::new(PartitionSnapshot::default()));
        }
        partitions[index] = Arc::new(snapshot);

        let version = guard.version + 1;
        *guard = Arc::new(StoreView { version, partitions });
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition_with(partition: u32, session: &str) -> PartitionSnapshot {
        let mut sessions = HashMap::new();
        sessions.insert(
            session.to_string(),
            Arc::new(SessionSnapshot {
                session_id: session.to_string(),
                partition,
                ..Default::default()
            }),
        );
        PartitionSnapshot {
            partition,
            version: 1,
            sessions,
        }
    }

    #[test]
    fn test_readers_keep_their_view_across_publishes() {
        let store = SnapshotStore::new(2);
        let before = store.load();

        assert_eq!(store.publish(partition_with(1, "s1")), 1);

        assert_eq!(before.version, 0);
        assert!(!before.contains_session("s1"));

        let after = store.load();
        assert_eq!(after.version, 1);
        assert_eq!(after.session_slices("s1").len(), 1);
        assert_eq!(after.partitions.len(), 2);
    }

    #[test]
    fn test_untouched_partitions_are_shared() {
        let store = SnapshotStore::new(2);
        store.publish(partition_with(0, "s1"));
        let first = store.load();
        store.publish(partition_with(1, "s1"));
        let second = store.load();

        assert!(Arc::ptr_eq(&first.partitions[0], &second.partitions[0]));
        assert_eq!(second.session_slices("s1").len(), 2);
    }
}
