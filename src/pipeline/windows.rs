//! Event-time windows per session
//!
//! Windows are aligned to multiples of the slide from the UNIX epoch. In
//! tumbling mode slide == width, so every event lands in exactly one window.
//! A window is `[start, end)`; it closes once the session watermark reaches
//! `end` and its aggregates are frozen from then on.

use super::types::StateKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    Tumbling,
    Sliding,
}

impl WindowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowMode::Tumbling => "tumbling",
            WindowMode::Sliding => "sliding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tumbling" => Some(WindowMode::Tumbling),
            "sliding" => Some(WindowMode::Sliding),
            _ => None,
        }
    }
}

/// Window geometry, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub mode: WindowMode,
    pub width_ms: i64,
    pub slide_ms: i64,
}

impl WindowSpec {
    pub fn tumbling(width_ms: i64) -> Self {
        Self {
            mode: WindowMode::Tumbling,
            width_ms,
            slide_ms: width_ms,
        }
    }

    pub fn sliding(width_ms: i64, slide_ms: i64) -> Self {
        Self {
            mode: WindowMode::Sliding,
            width_ms,
            slide_ms,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width_ms <= 0 {
            return Err(format!("window width must be positive, got {}", self.width_ms));
        }
        if self.slide_ms <= 0 || self.slide_ms > self.width_ms {
            return Err(format!(
                "window slide must be in 1..={}, got {}",
                self.width_ms, self.slide_ms
            ));
        }
        Ok(())
    }

    /// Start times of every window containing `t`, ascending.
    pub fn starts_containing(&self, t: i64) -> Vec<i64> {
        let mut start = t.div_euclid(self.slide_ms) * self.slide_ms;
        let mut starts = Vec::with_capacity((self.width_ms / self.slide_ms) as usize);
        while start > t - self.width_ms {
            starts.push(start);
            start -= self.slide_ms;
        }
        starts.reverse();
        starts
    }

    /// Earliest aligned window start whose end lies beyond `watermark_ms`.
    pub fn first_start_after(&self, watermark_ms: i64) -> i64 {
        let candidate = (watermark_ms - self.width_ms).div_euclid(self.slide_ms) * self.slide_ms;
        let mut start = candidate;
        while start + self.width_ms <= watermark_ms {
            start += self.slide_ms;
        }
        start
    }
}

/// Incremental `(count, sum, min, max)` over numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl RunningAggregate {
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// One per-car/metric aggregate row of a window, as exposed to readers and
/// written to the `window_aggregates` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowAggregateRecord {
    pub session_id: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub car_number: String,
    pub metric_name: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub finalized: bool,
    /// `timestampMonotonic` values folded into the row, carried only on the
    /// persistence path so open windows survive a restart
    #[serde(skip)]
    pub folded_timestamps: Vec<u64>,
}

#[derive(Debug, Clone)]
struct AggregateCell {
    aggregate: RunningAggregate,
    /// `timestampMonotonic` values already folded in
    folded: HashSet<u64>,
}

#[derive(Debug, Clone)]
struct OpenWindow {
    end: i64,
    cells: HashMap<StateKey, AggregateCell>,
}

impl OpenWindow {
    fn records(&self, session_id: &str, start: i64, finalized: bool) -> Vec<WindowAggregateRecord> {
        self.build_records(session_id, start, finalized, false)
    }

    fn build_records(
        &self,
        session_id: &str,
        start: i64,
        finalized: bool,
        with_folded: bool,
    ) -> Vec<WindowAggregateRecord> {
        let mut records: Vec<_> = self
            .cells
            .iter()
            .map(|(key, cell)| WindowAggregateRecord {
                session_id: session_id.to_string(),
                window_start_ms: start,
                window_end_ms: self.end,
                car_number: key.car_number.clone(),
                metric_name: key.metric_name.clone(),
                count: cell.aggregate.count,
                sum: cell.aggregate.sum,
                min: cell.aggregate.min,
                max: cell.aggregate.max,
                finalized,
                folded_timestamps: if with_folded {
                    let mut folded: Vec<u64> = cell.folded.iter().copied().collect();
                    folded.sort_unstable();
                    folded
                } else {
                    Vec::new()
                },
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.car_number, &a.metric_name).cmp(&(&b.car_number, &b.metric_name))
        });
        records
    }
}

/// Result of offering one event to the session's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdmission {
    /// Folded into this many open windows
    Admitted(usize),
    /// Every window containing the event had already folded it
    Duplicate,
    /// Every window containing the event is already closed
    Late,
}

/// Open and closed windows of one session within one partition.
#[derive(Debug, Clone)]
pub struct SessionWindows {
    session_id: String,
    spec: WindowSpec,
    open: BTreeMap<i64, OpenWindow>,
    closed: Vec<WindowAggregateRecord>,
    /// Windows with `end <= closed_through` are closed
    closed_through: Option<i64>,
    /// Open window starts touched since the last drain
    dirty: BTreeSet<i64>,
}

impl SessionWindows {
    pub fn new(session_id: impl Into<String>, spec: WindowSpec) -> Self {
        Self {
            session_id: session_id.into(),
            spec,
            open: BTreeMap::new(),
            closed: Vec::new(),
            closed_through: None,
            dirty: BTreeSet::new(),
        }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    fn is_closed(&self, end: i64) -> bool {
        self.closed_through.map_or(false, |through| end <= through)
    }

    /// Fold one numeric observation into every open window containing
    /// `event_ms`, creating windows lazily.
    pub fn admit(
        &mut self,
        key: &StateKey,
        timestamp_monotonic: u64,
        event_ms: i64,
        value: f64,
    ) -> WindowAdmission {
        let mut folded = 0usize;
        let mut duplicates = 0usize;

        for start in self.spec.starts_containing(event_ms) {
            let end = start + self.spec.width_ms;
            if self.is_closed(end) {
                continue;
            }

            let window = self.open.entry(start).or_insert_with(|| OpenWindow {
                end,
                cells: HashMap::new(),
            });

            match window.cells.get_mut(key) {
                Some(cell) => {
                    if cell.folded.insert(timestamp_monotonic) {
                        cell.aggregate.add(value);
                        folded += 1;
                    } else {
                        duplicates += 1;
                        continue;
                    }
                }
                None => {
                    let mut seen = HashSet::new();
                    seen.insert(timestamp_monotonic);
                    window.cells.insert(
                        key.clone(),
                        AggregateCell {
                            aggregate: RunningAggregate::new(value),
                            folded: seen,
                        },
                    );
                    folded += 1;
                }
            }
            self.dirty.insert(start);
        }

        if folded > 0 {
            WindowAdmission::Admitted(folded)
        } else if duplicates > 0 {
            WindowAdmission::Duplicate
        } else {
            WindowAdmission::Late
        }
    }

    /// Whether an event at `event_ms` would fall entirely into closed windows.
    pub fn is_late(&self, event_ms: i64) -> bool {
        match self.closed_through {
            Some(_) => self
                .spec
                .starts_containing(event_ms)
                .into_iter()
                .all(|start| self.is_closed(start + self.spec.width_ms)),
            None => false,
        }
    }

    /// Close every open window whose end is at or before `watermark_ms`.
    ///
    /// Returns the frozen records. After closing, the next window following the
    /// last closed one is opened so boundaries stay contiguous.
    pub fn advance_to(&mut self, watermark_ms: i64) -> Vec<WindowAggregateRecord> {
        if self.closed_through.map_or(false, |through| watermark_ms <= through) {
            return Vec::new();
        }

        let mut frozen = Vec::new();
        let closing: Vec<i64> = self
            .open
            .iter()
            .filter(|(_, w)| w.end <= watermark_ms)
            .map(|(start, _)| *start)
            .collect();

        for start in &closing {
            if let Some(window) = self.open.remove(start) {
                frozen.extend(window.records(&self.session_id, *start, true));
            }
            self.dirty.remove(start);
        }
        self.closed_through = Some(watermark_ms);

        if !closing.is_empty() {
            let next = self.spec.first_start_after(watermark_ms);
            let end = next + self.spec.width_ms;
            self.open.entry(next).or_insert_with(|| OpenWindow {
                end,
                cells: HashMap::new(),
            });
        }

        self.closed.extend(frozen.iter().cloned());
        frozen
    }

    /// Finalize every open window regardless of the watermark.
    pub fn flush_all(&mut self) -> Vec<WindowAggregateRecord> {
        let mut frozen = Vec::new();
        let open = std::mem::take(&mut self.open);
        let mut last_end = self.closed_through;
        for (start, window) in open {
            last_end = Some(last_end.map_or(window.end, |e| e.max(window.end)));
            frozen.extend(window.records(&self.session_id, start, true));
        }
        self.dirty.clear();
        self.closed_through = last_end;
        self.closed.extend(frozen.iter().cloned());
        frozen
    }

    /// Current values of open windows touched since the previous drain,
    /// with their folded timestamps.
    pub fn drain_dirty(&mut self) -> Vec<WindowAggregateRecord> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|start| {
                self.open
                    .get(&start)
                    .map(|w| w.build_records(&self.session_id, start, false, true))
            })
            .flatten()
            .collect()
    }

    /// Reinstate one persisted row after a restart.
    ///
    /// Finalized rows become closed windows and move `closed_through` up to
    /// their end. Open rows get their aggregate and folded timestamps back,
    /// so replayed events are recognised as duplicates.
    pub fn restore(&mut self, record: &WindowAggregateRecord) {
        let key = StateKey::new(record.car_number.clone(), record.metric_name.clone());

        if record.finalized {
            let end = record.window_end_ms;
            self.closed_through = Some(self.closed_through.map_or(end, |t| t.max(end)));
            self.open.remove(&record.window_start_ms);
            self.dirty.remove(&record.window_start_ms);
            self.closed.push(WindowAggregateRecord {
                folded_timestamps: Vec::new(),
                ..record.clone()
            });
            return;
        }
        if self.is_closed(record.window_end_ms) {
            return;
        }

        let window = self
            .open
            .entry(record.window_start_ms)
            .or_insert_with(|| OpenWindow {
                end: record.window_end_ms,
                cells: HashMap::new(),
            });
        window.cells.insert(
            key,
            AggregateCell {
                aggregate: RunningAggregate {
                    count: record.count,
                    sum: record.sum,
                    min: record.min,
                    max: record.max,
                },
                folded: record.folded_timestamps.iter().copied().collect(),
            },
        );
    }

    pub fn open_records(&self) -> Vec<WindowAggregateRecord> {
        self.open
            .iter()
            .flat_map(|(start, w)| w.records(&self.session_id, *start, false))
            .collect()
    }

    pub fn closed_records(&self) -> &[WindowAggregateRecord] {
        &self.closed
    }

    pub fn open_window_count(&self) -> usize {
        self.open.len()
    }

    /// Start of the oldest still-open window.
    pub fn oldest_open_start(&self) -> Option<i64> {
        self.open.keys().next().copied()
    }
}
