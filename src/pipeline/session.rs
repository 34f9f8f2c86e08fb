//! Session lifecycle registry
//!
//! `CREATED → ACTIVE → FINALIZING → CLOSED`, shared by all partition workers.
//! The registry also holds the session-wide watermark: every partition
//! publishes the max event time it has seen for a session, and windows close
//! against `max(partition maxima) - allowed lateness`.

use super::config::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ordered by lifecycle progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Active,
    Finalizing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "CREATED",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Finalizing => "FINALIZING",
            SessionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(SessionStatus::Created),
            "ACTIVE" => Some(SessionStatus::Active),
            "FINALIZING" => Some(SessionStatus::Finalizing),
            "CLOSED" => Some(SessionStatus::Closed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Created, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Finalizing)
                | (SessionStatus::Finalizing, SessionStatus::Closed)
        )
    }
}

/// How a worker must treat an event for a session at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Merge into state and windows
    Accept,
    /// FINALIZING before the deadline: merge into state only, count as late
    StateOnly,
    /// CLOSED or past the grace deadline
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub watermark_ms: Option<i64>,
    pub finalize_deadline_ms: Option<i64>,
    pub closed_at_ms: Option<i64>,
    pub archived: bool,
}

impl SessionView {
    pub fn admission(&self, now_ms: i64) -> Admission {
        match self.status {
            SessionStatus::Created | SessionStatus::Active => Admission::Accept,
            SessionStatus::Finalizing => match self.finalize_deadline_ms {
                Some(deadline) if now_ms >= deadline => Admission::Drop,
                _ => Admission::StateOnly,
            },
            SessionStatus::Closed => Admission::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransition {
    pub session_id: String,
    pub from: SessionStatus,
    pub to: SessionStatus,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub transitions: Vec<SessionTransition>,
    pub archived: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

#[derive(Debug)]
struct SessionEntry {
    status: SessionStatus,
    last_activity_ms: i64,
    partition_max_event_ms: HashMap<u32, i64>,
    participants: BTreeSet<u32>,
    acknowledged: BTreeSet<u32>,
    finalize_deadline_ms: Option<i64>,
    closed_at_ms: Option<i64>,
    archived: bool,
    /// Changed since the last `take_changed`
    unsaved: bool,
}

impl SessionEntry {
    fn new(now_ms: i64) -> Self {
        Self {
            status: SessionStatus::Created,
            last_activity_ms: now_ms,
            partition_max_event_ms: HashMap::new(),
            participants: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            finalize_deadline_ms: None,
            closed_at_ms: None,
            archived: false,
            unsaved: true,
        }
    }

    fn all_acknowledged(&self) -> bool {
        self.participants.is_subset(&self.acknowledged)
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    allowed_lateness_ms: i64,
    inactivity_ms: i64,
    grace_ms: i64,
    retention_ms: i64,
}

impl SessionRegistry {
    pub fn new(allowed_lateness_ms: i64, inactivity_ms: i64, grace_ms: i64, retention_ms: i64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            allowed_lateness_ms,
            inactivity_ms,
            grace_ms,
            retention_ms,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.allowed_lateness_ms,
            config.session_inactivity_ms,
            config.session_grace_ms,
            config.session_retention_ms,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view_of(&self, session_id: &str, entry: &SessionEntry) -> SessionView {
        SessionView {
            session_id: session_id.to_string(),
            status: entry.status,
            watermark_ms: entry
                .partition_max_event_ms
                .values()
                .max()
                .map(|max| max - self.allowed_lateness_ms),
            finalize_deadline_ms: entry.finalize_deadline_ms,
            closed_at_ms: entry.closed_at_ms,
            archived: entry.archived,
        }
    }

    fn transition(
        session_id: &str,
        entry: &mut SessionEntry,
        next: SessionStatus,
    ) -> Option<SessionTransition> {
        if !entry.status.can_transition_to(next) {
            log::debug!(
                "Ignoring session {} transition {} → {}",
                session_id,
                entry.status.as_str(),
                next.as_str()
            );
            return None;
        }

        let from = entry.status;
        entry.status = next;
        entry.unsaved = true;
        log::info!("🏁 Session {}: {} → {}", session_id, from.as_str(), next.as_str());
        Some(SessionTransition {
            session_id: session_id.to_string(),
            from,
            to: next,
        })
    }

    fn begin_finalizing(
        &self,
        session_id: &str,
        entry: &mut SessionEntry,
        now_ms: i64,
    ) -> Vec<SessionTransition> {
        let mut transitions = Vec::new();
        if entry.status == SessionStatus::Created {
            transitions.extend(Self::transition(session_id, entry, SessionStatus::Active));
        }
        if let Some(t) = Self::transition(session_id, entry, SessionStatus::Finalizing) {
            entry.finalize_deadline_ms = Some(now_ms + self.grace_ms);
            transitions.push(t);
        }
        transitions
    }

    /// Reinstate a session persisted before a restart.
    ///
    /// Status, deadline, close time and archival come back as stored; the
    /// inactivity clock restarts at `now_ms`. Known sessions are left alone.
    pub fn restore(&self, stored: &SessionView, now_ms: i64) -> SessionView {
        let mut sessions = self.lock();
        let entry = sessions
            .entry(stored.session_id.clone())
            .or_insert_with(|| SessionEntry {
                status: stored.status,
                finalize_deadline_ms: stored.finalize_deadline_ms,
                closed_at_ms: stored.closed_at_ms,
                archived: stored.archived,
                unsaved: false,
                ..SessionEntry::new(now_ms)
            });
        self.view_of(&stored.session_id, entry)
    }

    /// Sessions created or changed since the previous call, for persistence.
    pub fn take_changed(&self) -> Vec<SessionView> {
        let mut sessions = self.lock();
        let mut changed: Vec<_> = sessions
            .iter_mut()
            .filter(|(_, entry)| entry.unsaved)
            .map(|(id, entry)| {
                entry.unsaved = false;
                self.view_of(id, entry)
            })
            .collect();
        changed.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        changed
    }

    /// Flag sessions whose persistence failed so the next round retries.
    pub fn mark_unsaved(&self, session_ids: &[String]) {
        let mut sessions = self.lock();
        for id in session_ids {
            if let Some(entry) = sessions.get_mut(id) {
                entry.unsaved = true;
            }
        }
    }

    /// Register a session announced by the feed (idempotent).
    pub fn create(&self, session_id: &str, now_ms: i64) -> SessionView {
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| {
            log::info!("🆕 Session {} created", session_id);
            SessionEntry::new(now_ms)
        });
        self.view_of(session_id, entry)
    }

    /// Record that `partition` is about to apply events for `session_id`.
    ///
    /// Creates unknown sessions, moves CREATED to ACTIVE on the first event and
    /// refreshes the inactivity clock while the session accepts events.
    pub fn observe(&self, session_id: &str, partition: u32, now_ms: i64) -> SessionView {
        let mut sessions = self.lock();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(now_ms));

        if entry.status == SessionStatus::Created {
            Self::transition(session_id, entry, SessionStatus::Active);
        }
        if entry.status == SessionStatus::Active {
            entry.last_activity_ms = now_ms;
            entry.participants.insert(partition);
        }
        self.view_of(session_id, entry)
    }

    /// Publish a partition's max observed event time and return the session-wide view.
    pub fn publish_watermark(
        &self,
        session_id: &str,
        partition: u32,
        max_event_ms: Option<i64>,
    ) -> Option<SessionView> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(session_id)?;
        if let Some(max) = max_event_ms {
            let slot = entry.partition_max_event_ms.entry(partition).or_insert(max);
            *slot = (*slot).max(max);
        }
        Some(self.view_of(session_id, entry))
    }

    /// Explicit end-of-session signal. Idempotent once FINALIZING or CLOSED.
    pub fn end_session(&self, session_id: &str, now_ms: i64) -> SessionView {
        let mut sessions = self.lock();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(now_ms));
        self.begin_finalizing(session_id, entry, now_ms);
        self.view_of(session_id, entry)
    }

    /// A partition finished flushing its open windows for a FINALIZING session.
    pub fn acknowledge_flush(
        &self,
        session_id: &str,
        partition: u32,
        now_ms: i64,
    ) -> Result<SessionView, SessionError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        entry.acknowledged.insert(partition);
        if entry.status == SessionStatus::Finalizing && entry.all_acknowledged() {
            log::info!(
                "   └─ all {} partitions flushed session {}",
                entry.participants.len(),
                session_id
            );
            if Self::transition(session_id, entry, SessionStatus::Closed).is_some() {
                entry.closed_at_ms = Some(now_ms);
            }
        }
        Ok(self.view_of(session_id, entry))
    }

    /// Time-driven transitions: inactivity, grace deadline, archival.
    pub fn tick(&self, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();
        let mut sessions = self.lock();

        for (session_id, entry) in sessions.iter_mut() {
            match entry.status {
                SessionStatus::Created | SessionStatus::Active => {
                    if now_ms - entry.last_activity_ms >= self.inactivity_ms {
                        log::info!("⏱️  Session {} inactive for {}ms", session_id, now_ms - entry.last_activity_ms);
                        report
                            .transitions
                            .extend(self.begin_finalizing(session_id, entry, now_ms));
                    }
                }
                SessionStatus::Finalizing => {
                    let expired = entry.finalize_deadline_ms.map_or(true, |d| now_ms >= d);
                    if entry.all_acknowledged() || expired {
                        if !entry.all_acknowledged() {
                            log::warn!(
                                "⚠️  Session {} grace expired with {}/{} partitions acknowledged",
                                session_id,
                                entry.acknowledged.intersection(&entry.participants).count(),
                                entry.participants.len()
                            );
                        }
                        if let Some(t) = Self::transition(session_id, entry, SessionStatus::Closed) {
                            entry.closed_at_ms = Some(now_ms);
                            report.transitions.push(t);
                        }
                    }
                }
                SessionStatus::Closed => {
                    let due = entry
                        .closed_at_ms
                        .map_or(false, |closed| now_ms - closed >= self.retention_ms);
                    if due && !entry.archived {
                        entry.archived = true;
                        entry.unsaved = true;
                        log::info!("📦 Session {} archived", session_id);
                        report.archived.push(session_id.clone());
                    }
                }
            }
        }

        report
    }

    pub fn view(&self, session_id: &str) -> Option<SessionView> {
        let sessions = self.lock();
        sessions
            .get(session_id)
            .map(|entry| self.view_of(session_id, entry))
    }

    /// Every known session, sorted by id.
    pub fn views(&self) -> Vec<SessionView> {
        let sessions = self.lock();
        let mut views: Vec<_> = sessions
            .iter()
            .map(|(id, entry)| self.view_of(id, entry))
            .collect();
        views.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(5_000, 300_000, 10_000, 3_600_000)
    }

    #[test]
    fn test_transition_table() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Closed));
        assert!(!Created.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Finalizing.can_transition_to(Active));
    }

    #[test]
    fn test_first_event_activates() {
        let registry = registry();
        assert_eq!(registry.create("s1", 0).status, SessionStatus::Created);
        assert_eq!(registry.observe("s1", 0, 10).status, SessionStatus::Active);
    }

    #[test]
    fn test_watermark_is_max_across_partitions_minus_lateness() {
        let registry = registry();
        registry.observe("s1", 0, 0);
        registry.observe("s1", 1, 0);

        registry.publish_watermark("s1", 0, Some(61_000));
        let view = registry.publish_watermark("s1", 1, Some(40_000)).unwrap();
        assert_eq!(view.watermark_ms, Some(56_000));

        // Never regresses
        let view = registry.publish_watermark("s1", 0, Some(10_000)).unwrap();
        assert_eq!(view.watermark_ms, Some(56_000));
    }

    #[test]
    fn test_close_after_every_partition_acknowledges() {
        let registry = registry();
        registry.observe("s1", 0, 0);
        registry.observe("s1", 3, 0);

        let view = registry.end_session("s1", 1_000);
        assert_eq!(view.status, SessionStatus::Finalizing);
        assert_eq!(view.finalize_deadline_ms, Some(11_000));
        assert_eq!(view.admission(5_000), Admission::StateOnly);

        let view = registry.acknowledge_flush("s1", 0, 2_000).unwrap();
        assert_eq!(view.status, SessionStatus::Finalizing);

        let view = registry.acknowledge_flush("s1", 3, 3_000).unwrap();
        assert_eq!(view.status, SessionStatus::Closed);
        assert_eq!(view.closed_at_ms, Some(3_000));
        assert_eq!(view.admission(3_001), Admission::Drop);
    }

    #[test]
    fn test_grace_deadline_forces_close() {
        let registry = registry();
        registry.observe("s1", 0, 0);
        registry.end_session("s1", 0);

        assert!(registry.tick(9_999).transitions.is_empty());
        assert_eq!(registry.view("s1").unwrap().admission(10_000), Admission::Drop);

        let report = registry.tick(10_000);
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].to, SessionStatus::Closed);
    }

    #[test]
    fn test_inactivity_finalizes_then_retention_archives() {
        let registry = SessionRegistry::new(0, 1_000, 0, 5_000);
        registry.observe("s1", 0, 0);

        let report = registry.tick(1_000);
        assert_eq!(report.transitions[0].to, SessionStatus::Finalizing);

        // Grace of zero: closes on the next tick even without acknowledgement
        registry.tick(1_000);
        assert_eq!(registry.view("s1").unwrap().status, SessionStatus::Closed);

        assert!(registry.tick(5_999).archived.is_empty());
        assert_eq!(registry.tick(6_000).archived, vec!["s1".to_string()]);
        assert!(registry.view("s1").unwrap().archived);
    }

    #[test]
    fn test_end_signal_is_idempotent() {
        let registry = registry();
        registry.observe("s1", 0, 0);
        registry.end_session("s1", 100);
        let view = registry.end_session("s1", 5_000);
        assert_eq!(view.finalize_deadline_ms, Some(10_100));
    }

    #[test]
    fn test_late_observer_does_not_join_participants() {
        let registry = registry();
        registry.observe("s1", 0, 0);
        registry.end_session("s1", 0);
        registry.observe("s1", 7, 1);

        let view = registry.acknowledge_flush("s1", 0, 2).unwrap();
        assert_eq!(view.status, SessionStatus::Closed);
    }

    #[test]
    fn test_changed_sessions_are_reported_once() {
        let registry = registry();
        registry.create("s1", 0);
        registry.observe("s2", 0, 0);

        let changed = registry.take_changed();
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[1].status, SessionStatus::Active);
        assert!(registry.take_changed().is_empty());

        registry.end_session("s2", 10);
        let changed = registry.take_changed();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, SessionStatus::Finalizing);

        registry.mark_unsaved(&["s2".to_string()]);
        assert_eq!(registry.take_changed().len(), 1);
    }

    #[test]
    fn test_restore_keeps_stored_status() {
        let registry = registry();
        let stored = SessionView {
            session_id: "s1".to_string(),
            status: SessionStatus::Closed,
            watermark_ms: None,
            finalize_deadline_ms: Some(900),
            closed_at_ms: Some(1_000),
            archived: false,
        };

        let view = registry.restore(&stored, 50_000);
        assert_eq!(view.status, SessionStatus::Closed);
        assert_eq!(view.closed_at_ms, Some(1_000));
        assert!(registry.take_changed().is_empty());

        // Replayed events stay out of a closed session
        assert_eq!(registry.observe("s1", 0, 50_001).admission(50_001), Admission::Drop);

        // Retention still counts from the stored close time
        assert_eq!(registry.tick(3_601_000).archived, vec!["s1".to_string()]);
        assert!(registry.take_changed()[0].archived);
    }

    #[test]
    fn test_status_order_and_parse() {
        assert!(SessionStatus::Created < SessionStatus::Active);
        assert!(SessionStatus::Finalizing < SessionStatus::Closed);
        for status in [SessionStatus::Created, SessionStatus::Closed] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("open"), None);
    }
}
