//! Batching publisher between the feed reader and the partitioned event log
//!
//! Events arrive on a bounded mpsc queue, are grouped per partition and
//! appended in batches. A batch that still fails after bounded retries is
//! spooled to disk and retried on later cycles; while anything is spooled,
//! new batches are appended to the spool behind it so per-car order holds.

use super::config::PublisherConfig;
use super::flow::FlowControl;
use super::log::EventLog;
use super::partition::partition_for;
use super::spool::{Spool, SpoolError};
use crate::backoff::ExponentialBackoff;
use crate::pipeline::types::TelemetryEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("spool failure: {0}")]
    Spool(#[from] SpoolError),
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub events_received: AtomicU64,
    pub events_published: AtomicU64,
    pub batches_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub events_spooled: AtomicU64,
    pub events_unspooled: AtomicU64,
    pub spool_depth: AtomicU64,
    pub throttle_activations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStatsSnapshot {
    pub events_received: u64,
    pub events_published: u64,
    pub batches_published: u64,
    pub publish_failures: u64,
    pub events_spooled: u64,
    pub events_unspooled: u64,
    pub spool_depth: u64,
    pub throttle_activations: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PublisherStatsSnapshot {
            events_received: load(&self.events_received),
            events_published: load(&self.events_published),
            batches_published: load(&self.batches_published),
            publish_failures: load(&self.publish_failures),
            events_spooled: load(&self.events_spooled),
            events_unspooled: load(&self.events_unspooled),
            spool_depth: load(&self.spool_depth),
            throttle_activations: load(&self.throttle_activations),
        }
    }
}

pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    spool: Spool,
    flow: Arc<FlowControl>,
    config: PublisherConfig,
    stats: Arc<PublisherStats>,
    spool_blocked: bool,
}

impl EventPublisher {
    /// Opens the spool (reloading anything left from a previous run) and
    /// applies its depth to `flow` right away.
    pub fn new(
        log: Arc<dyn EventLog>,
        config: PublisherConfig,
        flow: Arc<FlowControl>,
    ) -> Result<Self, PublishError> {
        let spool = Spool::open(&config.spool_path)?;
        let publisher = Self {
            log,
            spool,
            flow,
            config,
            stats: Arc::new(PublisherStats::default()),
            spool_blocked: false,
        };
        publisher.update_flow();
        Ok(publisher)
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    /// Main loop. Returns after `shutdown` fires (or every sender is gone)
    /// and the remaining queue has been drained to the log or the spool.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<TelemetryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PublishError> {
        log::info!(
            "🚀 Publisher started (topic: {}, batch: {}, linger: {}ms, spooled: {})",
            self.log.topic(),
            self.config.publish_batch,
            self.config.linger_ms,
            self.spool.len()
        );

        let mut buffer: Vec<TelemetryEvent> = Vec::with_capacity(self.config.publish_batch);
        let mut linger = interval(Duration::from_millis(self.config.linger_ms));
        linger.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_log_time = Instant::now();
        let mut published_at_last_log = 0u64;

        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                            buffer.push(event);
                            if buffer.len() >= self.config.publish_batch {
                                self.flush(&mut buffer).await?;
                            }
                        }
                        None => {
                            log::info!("🔄 Publisher input closed");
                            break;
                        }
                    }
                }

                _ = linger.tick() => {
                    self.flush(&mut buffer).await?;

                    // Log stats every 10 seconds
                    if last_log_time.elapsed().as_secs() >= 10 {
                        let published = self.stats.events_published.load(Ordering::Relaxed);
                        let per_sec = (published - published_at_last_log) as f64
                            / last_log_time.elapsed().as_secs_f64();
                        log::info!(
                            "📊 Publisher: {:.1} events/sec, spool depth {}{}",
                            per_sec,
                            self.spool.len(),
                            if self.flow.is_throttled() { " (throttled)" } else { "" }
                        );
                        last_log_time = Instant::now();
                        published_at_last_log = published;
                    }
                }

                _ = shutdown.changed() => {
                    log::info!("🔄 Publisher draining queue...");
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                        buffer.push(event);
                    }
                    break;
                }
            }
        }

        self.flush(&mut buffer).await?;

        let stats = self.stats.snapshot();
        log::info!("✅ Publisher stopped");
        log::info!("   ├─ Published: {} events in {} batches", stats.events_published, stats.batches_published);
        log::info!("   └─ Left in spool: {}", self.spool.len());
        Ok(())
    }

    /// Drain the spool, then publish `buffer` (or spool it behind what is
    /// still spooled).
    async fn flush(&mut self, buffer: &mut Vec<TelemetryEvent>) -> Result<(), PublishError> {
        self.drain_spool().await?;

        if buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(buffer);

        if !self.spool.is_empty() {
            self.spool_events(&batch)?;
        } else {
            let unpublished = self.append_partitioned(&batch, true).await;
            if !unpublished.is_empty() {
                log::warn!(
                    "⚠️  Retries exhausted, spooling {} of {} events",
                    unpublished.len(),
                    batch.len()
                );
                self.spool_events(&unpublished)?;
            }
        }

        self.update_flow();
        Ok(())
    }

    /// One attempt per spooled batch; stops at the first failure.
    ///
    /// If only some partitions of a batch succeed, the whole batch stays
    /// spooled and those partitions see the events again later. Consumers
    /// tolerate the duplicates.
    async fn drain_spool(&mut self) -> Result<(), PublishError> {
        while !self.spool.is_empty() {
            let batch = self.spool.peek(self.config.publish_batch);
            let unpublished = self.append_partitioned(&batch, false).await;

            if !unpublished.is_empty() {
                if !self.spool_blocked {
                    log::warn!("⚠️  Event log still unavailable, {} events spooled", self.spool.len());
                    self.spool_blocked = true;
                }
                break;
            }

            self.spool.consume(batch.len())?;
            self.stats
                .events_unspooled
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.update_flow();

            if self.spool.is_empty() {
                log::info!("✅ Spool drained");
                self.spool_blocked = false;
            }
        }
        Ok(())
    }

    /// Append `batch` grouped by partition, preserving per-partition order.
    /// Returns the events that could not be appended.
    async fn append_partitioned(&self, batch: &[TelemetryEvent], retry: bool) -> Vec<TelemetryEvent> {
        let partitions = self.log.partition_count();
        let mut grouped: BTreeMap<u32, Vec<TelemetryEvent>> = BTreeMap::new();
        for event in batch {
            grouped
                .entry(partition_for(&event.car_number, partitions))
                .or_default()
                .push(event.clone());
        }

        let mut unpublished = Vec::new();
        for (partition, events) in grouped {
            let mut backoff = ExponentialBackoff::new(
                self.config.backoff_initial_ms,
                self.config.backoff_max_ms,
                self.config.retries,
            );

            loop {
                match self.log.append(partition, &events).await {
                    Ok(_) => {
                        self.stats
                            .events_published
                            .fetch_add(events.len() as u64, Ordering::Relaxed);
                        self.stats.batches_published.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                        if !retry {
                            log::debug!("Partition {} append failed: {}", partition, e);
                            unpublished.extend(events);
                            break;
                        }
                        log::warn!("⚠️  Partition {} append failed: {}", partition, e);
                        if backoff.sleep().await.is_err() {
                            unpublished.extend(events);
                            break;
                        }
                    }
                }
            }
        }
        unpublished
    }

    fn spool_events(&mut self, events: &[TelemetryEvent]) -> Result<(), PublishError> {
        self.spool.append(events)?;
        self.stats
            .events_spooled
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn update_flow(&self) {
        self.flow.update(self.spool.len());
        self.stats
            .spool_depth
            .store(self.spool.len() as u64, Ordering::Relaxed);
        self.stats
            .throttle_activations
            .store(self.flow.activations(), Ordering::Relaxed);
    }
}
