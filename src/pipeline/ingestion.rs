//! StreamIngester: one consumer task per event log partition
//!
//! Worker cycle (every poll tick):
//! 1. Fetch a batch from the partition at the read offset
//! 2. Apply each event through the partition's engine
//! 3. Exchange watermarks with the session registry, close/flush windows
//! 4. Publish the partition snapshot for readers
//! 5. Persist pending state and window rows, then acknowledge flushes
//! 6. Commit the read offset to the consumer group
//!
//! Offsets are committed only after step 5 succeeds, so a crash replays
//! uncommitted records (at-least-once); merges are idempotent.
//!
//! On start, session statuses, CurrentState and window rows (open windows with
//! their folded timestamps) are reloaded for every session that is not
//! archived. The supervisor persists session status changes as they happen.

use super::config::PipelineConfig;
use super::db::{AggregateDbWriter, DbError};
use super::engine::PartitionEngine;
use super::metrics::IngestMetrics;
use super::session::{SessionRegistry, SessionView};
use super::snapshot::SnapshotStore;
use super::types::{system_clock, Clock};
use crate::admin::schema::REQUIRED_SCHEMAS;
use crate::admin::{verify_schemas, ProvisioningError, SchemaProvisioner};
use crate::publisher::log::{EventLog, LogEntry, LogError};
use crate::publisher::partition::partition_for;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("schema check failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("state store error: {0}")]
    Db(#[from] DbError),

    #[error("event log error: {0}")]
    Log(#[from] LogError),

    #[error("event log has {actual} partitions but {expected} are configured")]
    PartitionMismatch { expected: u32, actual: u32 },
}

struct WorkerContext {
    group: String,
    log: Arc<dyn EventLog>,
    db_writer: Arc<dyn AggregateDbWriter>,
    registry: Arc<SessionRegistry>,
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<IngestMetrics>,
    clock: Clock,
    poll_interval: Duration,
    fetch_batch: usize,
}

/// Running ingestion tasks.
pub struct IngesterHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl IngesterHandle {
    /// Wait for every worker to finish its final flush.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("❌ Ingestion task panicked: {}", e);
            }
        }
    }
}

pub struct StreamIngester {
    config: PipelineConfig,
    log: Arc<dyn EventLog>,
    db_writer: Arc<dyn AggregateDbWriter>,
    registry: Arc<SessionRegistry>,
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<IngestMetrics>,
    clock: Clock,
}

impl StreamIngester {
    pub fn new(
        config: PipelineConfig,
        log: Arc<dyn EventLog>,
        db_writer: Arc<dyn AggregateDbWriter>,
    ) -> Self {
        Self::new_with_clock(config, log, db_writer, system_clock())
    }

    /// Used for testing with deterministic wall-clock time.
    pub fn new_with_clock(
        config: PipelineConfig,
        log: Arc<dyn EventLog>,
        db_writer: Arc<dyn AggregateDbWriter>,
        clock: Clock,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::from_config(&config)),
            snapshots: Arc::new(SnapshotStore::new(config.partitions)),
            metrics: Arc::new(IngestMetrics::new()),
            config,
            log,
            db_writer,
            clock,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn snapshots(&self) -> Arc<SnapshotStore> {
        self.snapshots.clone()
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Verify schemas, restore state and spawn the partition workers.
    ///
    /// A missing required schema is fatal: no worker is spawned. Schemas are
    /// checked with the provisioner and then in the store the writer uses.
    pub async fn start(
        &self,
        provisioner: &dyn SchemaProvisioner,
        shutdown: watch::Receiver<bool>,
    ) -> Result<IngesterHandle, IngestError> {
        verify_schemas(provisioner, &REQUIRED_SCHEMAS).await?;
        for name in REQUIRED_SCHEMAS {
            if !self.db_writer.has_table(name).await? {
                log::error!(
                    "❌ Required table '{}' missing from the state store ({} reports it present)",
                    name,
                    provisioner.describe()
                );
                return Err(ProvisioningError::MissingSchema(name.to_string()).into());
            }
        }

        let partitions = self.config.partitions;
        if self.log.partition_count() != partitions {
            return Err(IngestError::PartitionMismatch {
                expected: partitions,
                actual: self.log.partition_count(),
            });
        }

        log::info!("🚀 Starting StreamIngester");
        log::info!("   ├─ Topic: {} ({} partitions)", self.log.topic(), partitions);
        log::info!("   ├─ Consumer group: {}", self.config.consumer_group);
        log::info!(
            "   ├─ Windows: {} {}ms (slide {}ms), lateness {}ms",
            self.config.window.mode.as_str(),
            self.config.window.width_ms,
            self.config.window.slide_ms,
            self.config.allowed_lateness_ms
        );
        log::info!("   └─ Aggregated metrics: {}", self.config.aggregate_metrics.join(","));

        let mut engines: Vec<PartitionEngine> = (0..partitions)
            .map(|p| {
                PartitionEngine::new(
                    p,
                    self.config.window,
                    self.config.allowed_lateness_ms,
                    &self.config.aggregate_metrics,
                    self.metrics.clone(),
                )
            })
            .collect();

        self.restore(&mut engines).await?;

        let ctx = Arc::new(WorkerContext {
            group: self.config.consumer_group.clone(),
            log: self.log.clone(),
            db_writer: self.db_writer.clone(),
            registry: self.registry.clone(),
            snapshots: self.snapshots.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            fetch_batch: self.config.fetch_batch,
        });

        let mut tasks = Vec::with_capacity(partitions as usize + 1);
        for engine in engines {
            tasks.push(tokio::spawn(run_partition_worker(
                engine,
                ctx.clone(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_session_supervisor(ctx, shutdown)));

        log::info!("✅ {} partition workers running", partitions);
        Ok(IngesterHandle { tasks })
    }

    /// Reload sessions, state and windows persisted before a restart.
    async fn restore(&self, engines: &mut [PartitionEngine]) -> Result<(), IngestError> {
        let partitions = self.config.partitions;
        let now = (self.clock)();

        let sessions = self.db_writer.load_sessions().await?;
        let archived = sessions.iter().filter(|s| s.archived).count();
        for stored in &sessions {
            self.registry.restore(stored, now);
        }

        let state = self.db_writer.load_state().await?;
        let windows = self.db_writer.load_windows().await?;
        if sessions.is_empty() && state.is_empty() && windows.is_empty() {
            return Ok(());
        }

        let mut state_by_partition: HashMap<u32, Vec<_>> = HashMap::new();
        for record in state {
            // Status row not written before the stop
            if self.registry.view(&record.session_id).is_none() {
                self.registry.create(&record.session_id, now);
            }
            state_by_partition
                .entry(partition_for(&record.car_number, partitions))
                .or_default()
                .push(record);
        }
        let mut windows_by_partition: HashMap<u32, Vec<_>> = HashMap::new();
        for record in windows {
            if self.registry.view(&record.session_id).is_none() {
                self.registry.create(&record.session_id, now);
            }
            windows_by_partition
                .entry(partition_for(&record.car_number, partitions))
                .or_default()
                .push(record);
        }

        let mut state_total = 0;
        for (partition, records) in state_by_partition {
            state_total += engines[partition as usize].restore_state(records);
        }
        let mut window_total = 0;
        for (partition, records) in windows_by_partition {
            window_total += engines[partition as usize].restore_windows(records);
        }

        log::info!("♻️  Restored from store");
        log::info!("   ├─ Sessions: {} ({} archived, served from the store)", sessions.len(), archived);
        log::info!("   ├─ Current-state entries: {}", state_total);
        log::info!("   └─ Window rows: {}", window_total);
        Ok(())
    }
}

async fn run_partition_worker(
    mut engine: PartitionEngine,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let partition = engine.partition();
    let mut read_offset = match committed_offset(&ctx, partition, &mut shutdown).await {
        Some(offset) => offset,
        None => return,
    };
    let mut committed = read_offset;
    log::info!("   ├─ Partition {} worker starting at offset {}", partition, read_offset);

    let mut poll = interval(ctx.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut event_count = 0u64;
    let mut last_log_time = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                log::info!("🔄 Partition {} final flush...", partition);
                if persist(&mut engine, &ctx).await && read_offset > committed {
                    commit(&ctx, partition, read_offset).await;
                }
                break;
            }

            _ = poll.tick() => {
                match ctx.log.fetch(partition, read_offset, ctx.fetch_batch).await {
                    Ok(entries) => {
                        if let Some(last) = entries.last() {
                            read_offset = last.offset + 1;
                            event_count += entries.len() as u64;
                            apply_batch(&mut engine, &ctx, &entries);
                        }
                    }
                    Err(e) => {
                        IngestMetrics::incr(&ctx.metrics.fetch_failures);
                        log::warn!("⚠️  Partition {} fetch failed: {}", partition, e);
                    }
                }

                engine.sync_sessions(&ctx.registry);
                if let Some(snapshot) = engine.build_snapshot() {
                    ctx.snapshots.publish(snapshot);
                }

                if persist(&mut engine, &ctx).await && read_offset > committed
                    && commit(&ctx, partition, read_offset).await
                {
                    committed = read_offset;
                }

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let per_sec = event_count as f64 / last_log_time.elapsed().as_secs_f64();
                    if event_count > 0 {
                        log::info!(
                            "📊 Partition {} ingestion rate: {:.1} events/sec (offset {})",
                            partition, per_sec, read_offset
                        );
                    }
                    last_log_time = Instant::now();
                    event_count = 0;
                }
            }
        }
    }

    log::info!("✅ Partition {} worker stopped at offset {}", partition, committed);
}

/// Committed offset for this partition, retried until it succeeds or shutdown.
async fn committed_offset(
    ctx: &WorkerContext,
    partition: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<u64> {
    loop {
        match ctx.log.committed(&ctx.group, partition).await {
            Ok(offset) => return Some(offset),
            Err(e) => {
                log::warn!("⚠️  Partition {} offset lookup failed: {}", partition, e);
                tokio::select! {
                    _ = shutdown.changed() => return None,
                    _ = tokio::time::sleep(ctx.poll_interval * 10) => {}
                }
            }
        }
    }
}

fn apply_batch(engine: &mut PartitionEngine, ctx: &WorkerContext, entries: &[LogEntry]) {
    let now = (ctx.clock)();
    let partition = engine.partition();
    let mut views: HashMap<&str, SessionView> = HashMap::new();

    for entry in entries {
        let session_id = entry.event.session_id.as_str();
        let view = views
            .entry(session_id)
            .or_insert_with(|| ctx.registry.observe(session_id, partition, now));
        let admission = view.admission(now);
        engine.apply(&entry.event, admission);
    }

    IngestMetrics::add(&ctx.metrics.events_consumed, entries.len() as u64);
    IngestMetrics::incr(&ctx.metrics.batches);
}

/// Write pending rows; on failure they are kept for the next cycle.
async fn persist(engine: &mut PartitionEngine, ctx: &WorkerContext) -> bool {
    let pending = engine.take_pending();
    if !pending.is_empty() {
        let result = match ctx.db_writer.write_state(pending.state.clone()).await {
            Ok(()) => ctx.db_writer.write_windows(pending.windows.clone()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => log::debug!(
                "✅ Partition {} persisted {} state rows, {} window rows",
                engine.partition(),
                pending.state.len(),
                pending.windows.len()
            ),
            Err(e) => {
                IngestMetrics::incr(&ctx.metrics.persist_failures);
                log::error!("❌ Partition {} persist failed: {}", engine.partition(), e);
                engine.restore_pending(pending);
                return false;
            }
        }
    }

    let now = (ctx.clock)();
    for session_id in engine.take_pending_acks() {
        if let Err(e) = ctx.registry.acknowledge_flush(&session_id, engine.partition(), now) {
            log::warn!("⚠️  Flush acknowledgement dropped: {}", e);
        }
    }
    true
}

async fn commit(ctx: &WorkerContext, partition: u32, next_offset: u64) -> bool {
    match ctx.log.commit(&ctx.group, partition, next_offset).await {
        Ok(()) => true,
        Err(e) => {
            IngestMetrics::incr(&ctx.metrics.commit_failures);
            log::warn!("⚠️  Partition {} commit of offset {} failed: {}", partition, next_offset, e);
            false
        }
    }
}

/// Write session status changes; failed rows are retried on the next tick.
async fn persist_sessions(ctx: &WorkerContext) {
    let changed = ctx.registry.take_changed();
    if changed.is_empty() {
        return;
    }
    let ids: Vec<String> = changed.iter().map(|s| s.session_id.clone()).collect();
    if let Err(e) = ctx.db_writer.write_sessions(changed).await {
        IngestMetrics::incr(&ctx.metrics.persist_failures);
        log::error!("❌ Session status persist failed: {}", e);
        ctx.registry.mark_unsaved(&ids);
    }
}

/// Drives time-based session transitions and logs periodic ingest stats.
async fn run_session_supervisor(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(ctx.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_log_time = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                persist_sessions(&ctx).await;
                break;
            }
            _ = tick.tick() => {
                ctx.registry.tick((ctx.clock)());
                persist_sessions(&ctx).await;

                if last_log_time.elapsed().as_secs() >= 10 {
                    let m = &ctx.metrics;
                    log::info!(
                        "📊 Ingest: consumed={} updates={} stale={} late={} dropped={} windows_closed={}",
                        m.events_consumed.load(Ordering::Relaxed),
                        m.state_updates.load(Ordering::Relaxed),
                        m.merge_conflicts.load(Ordering::Relaxed),
                        m.late_events.load(Ordering::Relaxed),
                        m.dropped_after_close.load(Ordering::Relaxed),
                        m.windows_closed.load(Ordering::Relaxed),
                    );
                    last_log_time = Instant::now();
                }
            }
        }
    }
}
