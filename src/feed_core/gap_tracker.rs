//! Feed outage tracking
//!
//! Records the outages that could not be resumed from the last cursor, i.e.
//! stretches of the feed that are lost for good.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GapTracker {
    disconnected_at: Option<Instant>,
    gaps: Vec<GapRecord>,
    total_gap_ms: u64,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream lost. Only the first call of an outage counts.
    pub fn mark_disconnected(&mut self, at: Instant) {
        self.disconnected_at.get_or_insert(at);
    }

    /// Stream back. Returns the gap length when the outage was not resumed.
    pub fn mark_reconnected(&mut self, at: Instant, resumed: bool) -> Option<u64> {
        let started = self.disconnected_at.take()?;
        if resumed {
            return None;
        }

        let duration_ms = at.saturating_duration_since(started).as_millis() as u64;
        self.gaps.push(GapRecord { duration_ms });
        self.total_gap_ms = self.total_gap_ms.saturating_add(duration_ms);
        Some(duration_ms)
    }

    pub fn gaps(&self) -> &[GapRecord] {
        &self.gaps
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    pub fn total_gap_ms(&self) -> u64 {
        self.total_gap_ms
    }

    pub fn in_outage(&self) -> bool {
        self.disconnected_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_connect_is_not_a_gap() {
        let mut tracker = GapTracker::new();
        assert_eq!(tracker.mark_reconnected(Instant::now(), false), None);
        assert_eq!(tracker.gap_count(), 0);
    }

    #[test]
    fn test_resumed_outage_is_not_a_gap() {
        let mut tracker = GapTracker::new();
        let t0 = Instant::now();
        tracker.mark_disconnected(t0);
        assert!(tracker.in_outage());
        assert_eq!(tracker.mark_reconnected(t0 + Duration::from_secs(3), true), None);
        assert_eq!(tracker.gap_count(), 0);
        assert!(!tracker.in_outage());
    }

    #[test]
    fn test_unresumed_outages_accumulate() {
        let mut tracker = GapTracker::new();
        let t0 = Instant::now();

        tracker.mark_disconnected(t0);
        // Repeated failures inside one outage keep the original start
        tracker.mark_disconnected(t0 + Duration::from_millis(500));
        assert_eq!(tracker.mark_reconnected(t0 + Duration::from_millis(1_500), false), Some(1_500));

        tracker.mark_disconnected(t0 + Duration::from_secs(10));
        tracker.mark_reconnected(t0 + Duration::from_millis(10_250), false);

        assert_eq!(tracker.gap_count(), 2);
        assert_eq!(tracker.total_gap_ms(), 1_750);
        assert_eq!(tracker.gaps()[1], GapRecord { duration_ms: 250 });
    }
}
