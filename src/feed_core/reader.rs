//! FeedReader - reconnecting read loop
//!
//! ```text
//! Disconnected → Connecting → Streaming ─┐
//!                    ↑                    │ stream lost
//!                    └───── Backoff ←─────┘
//! ```
//!
//! Decoded events go to the publisher queue (bounded, so a slow publisher
//! slows the reader). Session signals go to their own channel.

use super::connection::{ConnectionState, ConnectionTracker};
use super::decoder::{FeedItem, FrameDecoder, SessionSignal};
use super::gap_tracker::GapTracker;
use super::transport::FeedTransport;
use super::FeedConfig;
use crate::backoff::ExponentialBackoff;
use crate::pipeline::types::TelemetryEvent;
use crate::publisher::flow::FlowControl;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames_received: AtomicU64,
    pub events_forwarded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub ignored_topics: AtomicU64,
    pub session_signals: AtomicU64,
    pub connects: AtomicU64,
    pub connect_failures: AtomicU64,
    pub resumed: AtomicU64,
    pub gaps: AtomicU64,
    pub gap_ms_total: AtomicU64,
    pub throttle_waits: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub events_forwarded: u64,
    pub decode_errors: u64,
    pub ignored_topics: u64,
    pub session_signals: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub resumed: u64,
    pub gaps: u64,
    pub gap_ms_total: u64,
    pub throttle_waits: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FeedStatsSnapshot {
            frames_received: load(&self.frames_received),
            events_forwarded: load(&self.events_forwarded),
            decode_errors: load(&self.decode_errors),
            ignored_topics: load(&self.ignored_topics),
            session_signals: load(&self.session_signals),
            connects: load(&self.connects),
            connect_failures: load(&self.connect_failures),
            resumed: load(&self.resumed),
            gaps: load(&self.gaps),
            gap_ms_total: load(&self.gap_ms_total),
            throttle_waits: load(&self.throttle_waits),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct FeedReader<T: FeedTransport> {
    transport: T,
    decoder: FrameDecoder,
    backoff: ExponentialBackoff,
    flow: Arc<FlowControl>,
    stats: Arc<FeedStats>,
    connection: ConnectionTracker,
    gaps: GapTracker,
    cursor: Option<String>,
}

impl<T: FeedTransport> FeedReader<T> {
    pub fn new(transport: T, config: &FeedConfig, flow: Arc<FlowControl>) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(&config.session_id),
            backoff: ExponentialBackoff::unbounded(config.reconnect_initial_ms, config.reconnect_max_ms)
                .with_jitter(config.reconnect_jitter_ms),
            flow,
            stats: Arc::new(FeedStats::default()),
            connection: ConnectionTracker::new(),
            gaps: GapTracker::new(),
            cursor: None,
        }
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Run until shutdown or until the publisher queue closes.
    ///
    /// Arguments:
    /// - `events`: publisher queue
    /// - `signals`: session start/end signals
    /// - `shutdown`: stop signal
    pub async fn run(
        mut self,
        events: mpsc::Sender<TelemetryEvent>,
        signals: mpsc::Sender<SessionSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("🚀 Feed reader starting ({})", self.transport.describe());

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.transport.connect(self.cursor.as_deref()) => result,
                _ = shutdown.changed() => break 'outer,
            };

            match connected {
                Ok(resumed) => {
                    self.set_state(ConnectionState::Streaming);
                    self.on_connected(resumed);

                    loop {
                        let frame = tokio::select! {
                            frame = self.transport.next_frame() => frame,
                            _ = shutdown.changed() => break 'outer,
                        };

                        match frame {
                            Ok(Some(text)) => {
                                if let Flow::Stop = self.handle_frame(&text, &events, &signals, &mut shutdown).await {
                                    break 'outer;
                                }
                            }
                            Ok(None) => {
                                log::warn!("⚠️  Feed stream ended");
                                break;
                            }
                            Err(e) => {
                                log::warn!("⚠️  Feed stream error: {}", e);
                                break;
                            }
                        }
                    }

                    self.gaps.mark_disconnected(Instant::now());
                }
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    self.gaps.mark_disconnected(Instant::now());
                    log::warn!("⚠️  Feed connect failed: {}", e);
                }
            }

            self.set_state(ConnectionState::Backoff);
            tokio::select! {
                _ = self.backoff.sleep() => {}
                _ = shutdown.changed() => break 'outer,
            }
        }

        self.set_state(ConnectionState::Stopped);
        self.transport.close().await;

        let stats = self.stats.snapshot();
        log::info!("✅ Feed reader stopped");
        log::info!("   ├─ Frames: {} ({} malformed)", stats.frames_received, stats.decode_errors);
        log::info!("   ├─ Events forwarded: {}", stats.events_forwarded);
        log::info!("   └─ Gaps: {} ({}ms)", stats.gaps, stats.gap_ms_total);
    }

    fn on_connected(&mut self, resumed: bool) {
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.backoff.reset();

        if resumed {
            self.stats.resumed.fetch_add(1, Ordering::Relaxed);
            log::info!("✅ Feed resumed from cursor {:?}", self.cursor);
        } else {
            log::info!("✅ Feed connected");
            // A fresh stream invalidates the old cursor
            self.cursor = None;
        }

        if let Some(gap_ms) = self.gaps.mark_reconnected(Instant::now(), resumed) {
            self.stats.gaps.fetch_add(1, Ordering::Relaxed);
            self.stats.gap_ms_total.fetch_add(gap_ms, Ordering::Relaxed);
            log::warn!("⚠️  Feed gap of {}ms (not resumable)", gap_ms);
        }
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        events: &mpsc::Sender<TelemetryEvent>,
        signals: &mpsc::Sender<SessionSignal>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match self.decoder.decode(text, Utc::now()) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped malformed frame: {}", e);
                return Flow::Continue;
            }
        };

        if frame.ignored_topics > 0 {
            self.stats
                .ignored_topics
                .fetch_add(frame.ignored_topics as u64, Ordering::Relaxed);
        }
        if let Some(cursor) = frame.cursor {
            self.cursor = Some(cursor);
        }

        for item in frame.items {
            match item {
                FeedItem::Telemetry(event) => {
                    if self.flow.is_throttled() {
                        self.stats.throttle_waits.fetch_add(1, Ordering::Relaxed);
                        tokio::select! {
                            _ = self.flow.wait_ready() => {}
                            _ = shutdown.changed() => return Flow::Stop,
                        }
                    }
                    if events.send(event).await.is_err() {
                        log::warn!("⚠️  Publisher queue closed, stopping feed reader");
                        return Flow::Stop;
                    }
                    self.stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                FeedItem::Session(signal) => {
                    self.stats.session_signals.fetch_add(1, Ordering::Relaxed);
                    if signals.send(signal).await.is_err() {
                        log::debug!("Session signal dropped, no receiver");
                    }
                }
            }
        }
        Flow::Continue
    }

    fn set_state(&mut self, next: ConnectionState) {
        if let Err(e) = self.connection.transition(next) {
            log::error!("❌ {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_core::FeedError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted connection: `None` fails to connect, otherwise the frames
    /// it delivers before dropping.
    type Script = VecDeque<Option<Vec<String>>>;

    struct ScriptedTransport {
        script: Script,
        frames: VecDeque<String>,
        resume: bool,
        cursors: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn connect(&mut self, cursor: Option<&str>) -> Result<bool, FeedError> {
            self.cursors.lock().unwrap().push(cursor.map(str::to_string));
            match self.script.pop_front() {
                Some(Some(frames)) => {
                    self.frames = frames.into();
                    Ok(self.resume && cursor.is_some())
                }
                Some(None) => Err(FeedError::Negotiate("scripted failure".to_string())),
                None => std::future::pending().await,
            }
        }

        async fn next_frame(&mut self) -> Result<Option<String>, FeedError> {
            Ok(self.frames.pop_front())
        }

        async fn close(&mut self) {}

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn record(ts: u64) -> String {
        format!(
            r#"{{"sessionId":"s1","carNumber":"44","timestampMonotonic":{},"eventTimeUtc":"2024-05-26T13:00:00Z","metricName":"speed","value":"200"}}"#,
            ts
        )
    }

    fn fast_config() -> FeedConfig {
        let mut config = FeedConfig::from_lookup(&HashMap::<&str, &str>::new()).unwrap();
        config.reconnect_initial_ms = 1;
        config.reconnect_max_ms = 5;
        config.reconnect_jitter_ms = 0;
        config
    }

    async fn collect(rx: &mut mpsc::Receiver<TelemetryEvent>, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        while out.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.push(event.timestamp_monotonic);
        }
        out
    }

    #[tokio::test]
    async fn test_reconnects_and_drops_malformed_frames() {
        let cursors = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            script: VecDeque::from([
                Some(vec![record(1), "garbage".to_string(), r#"{"C":"c-7","M":[]}"#.to_string()]),
                None,
                None,
                Some(vec![record(2)]),
            ]),
            frames: VecDeque::new(),
            resume: false,
            cursors: cursors.clone(),
        };

        let reader = FeedReader::new(transport, &fast_config(), Arc::new(FlowControl::new(10, 5)));
        let stats = reader.stats();
        let (tx, mut rx) = mpsc::channel(16);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(tx, signal_tx, shutdown_rx));

        assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.connect_failures, 2);
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.gaps, 1);
        assert_eq!(snapshot.resumed, 0);

        let cursors = cursors.lock().unwrap().clone();
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1].as_deref(), Some("c-7"));
    }

    #[tokio::test]
    async fn test_resumed_reconnect_records_no_gap() {
        let transport = ScriptedTransport {
            script: VecDeque::from([
                Some(vec![r#"{"C":"c-1"}"#.to_string(), record(1)]),
                Some(vec![record(2)]),
            ]),
            frames: VecDeque::new(),
            resume: true,
            cursors: Arc::new(Mutex::new(Vec::new())),
        };

        let reader = FeedReader::new(transport, &fast_config(), Arc::new(FlowControl::new(10, 5)));
        let stats = reader.stats();
        let (tx, mut rx) = mpsc::channel(16);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(tx, signal_tx, shutdown_rx));

        assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.resumed, 1);
        assert_eq!(snapshot.gaps, 0);
    }

    #[tokio::test]
    async fn test_throttle_pauses_intake() {
        let transport = ScriptedTransport {
            script: VecDeque::from([Some(vec![record(1), record(2)])]),
            frames: VecDeque::new(),
            resume: false,
            cursors: Arc::new(Mutex::new(Vec::new())),
        };

        let flow = Arc::new(FlowControl::new(1, 1));
        flow.update(2);

        let reader = FeedReader::new(transport, &fast_config(), flow.clone());
        let stats = reader.stats();
        let (tx, mut rx) = mpsc::channel(16);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(tx, signal_tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().throttle_waits, 1);

        flow.update(0);
        assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_signals_are_routed() {
        let status = r#"{"M":[{"H":"Streaming","M":"feed","A":["SessionStatus",{"Status":"Ends"},"2024-05-26T15:00:00Z"]}]}"#;
        let transport = ScriptedTransport {
            script: VecDeque::from([Some(vec![status.to_string()])]),
            frames: VecDeque::new(),
            resume: false,
            cursors: Arc::new(Mutex::new(Vec::new())),
        };

        let reader = FeedReader::new(transport, &fast_config(), Arc::new(FlowControl::new(10, 5)));
        let (tx, _rx) = mpsc::channel(16);
        let (signal_tx, mut signal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(tx, signal_tx, shutdown_rx));

        let signal = tokio::time::timeout(Duration::from_secs(2), signal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, SessionSignal::Ended("live".to_string()));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
