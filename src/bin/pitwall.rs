//! Pitwall runtime
//!
//! Wires the whole pipeline in one process:
//! - FeedReader (live SignalR feed, or a recorded replay file)
//! - EventPublisher into the partitioned SQLite event log
//! - StreamIngester partition workers + session supervisor
//! - Query API for dashboards
//!
//! Usage:
//!   cargo run --release --bin pitwall
//!
//! Schemas must exist first (`pitwall_admin ensure`).
//!
//! Shutdown (CTRL+C) is staged: the feed side stops and drains into the log
//! or spool, then ingestion workers persist and commit, then the API stops.

use dotenv::dotenv;
use log::{error, info, warn};
use pitwall::admin::provisioner_from_config;
use pitwall::feed_core::{
    FeedConfig, FeedReader, FeedStats, FeedTransport, ReplayTransport, SessionSignal,
    SignalRTransport,
};
use pitwall::pipeline::{
    PipelineConfig, SessionRegistry, SqliteAggregateWriter, SqliteArchiveReader, StreamIngester,
};
use pitwall::publisher::{EventPublisher, FlowControl, PublisherConfig, SqliteEventLog};
use pitwall::query::{ApiState, QueryConfig, QueryGateway};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn spawn_reader<T: FeedTransport + 'static>(
    transport: T,
    config: &FeedConfig,
    flow: Arc<FlowControl>,
    events: mpsc::Sender<pitwall::pipeline::TelemetryEvent>,
    signals: mpsc::Sender<SessionSignal>,
    shutdown: watch::Receiver<bool>,
) -> (Arc<FeedStats>, JoinHandle<()>) {
    let reader = FeedReader::new(transport, config, flow);
    let stats = reader.stats();
    let handle = tokio::spawn(reader.run(events, signals, shutdown));
    (stats, handle)
}

/// Forwards session start/end signals from the feed to the registry.
async fn route_session_signals(
    mut signals: mpsc::Receiver<SessionSignal>,
    registry: Arc<SessionRegistry>,
) {
    while let Some(signal) = signals.recv().await {
        let now = chrono::Utc::now().timestamp_millis();
        match signal {
            SessionSignal::Started(session_id) => {
                registry.create(&session_id, now);
            }
            SessionSignal::Ended(session_id) => {
                let view = registry.end_session(&session_id, now);
                info!("🏁 End of session {} signalled ({})", session_id, view.status.as_str());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // webpki-backed TLS for reqwest and tungstenite; ignore if already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let pipeline_config = PipelineConfig::from_env()?;
    let publisher_config = PublisherConfig::from_env()?;
    let feed_config = FeedConfig::from_env()?;
    let query_config = QueryConfig::from_env()?;

    info!("🚀 Pitwall runtime");
    info!("   ├─ State store: {}", pipeline_config.db_path);
    info!("   ├─ Event log: {} (topic {})", pipeline_config.log_path, pipeline_config.topic);
    info!("   ├─ Partitions: {}", pipeline_config.partitions);
    info!("   ├─ Channel buffer: {} events", publisher_config.channel_buffer);
    info!("   ├─ Spool: {}", publisher_config.spool_path);
    info!("   └─ Query API: {}", query_config.query_addr);

    let event_log = Arc::new(SqliteEventLog::open(
        &pipeline_config.log_path,
        &pipeline_config.topic,
        pipeline_config.partitions,
    )?);
    let db_writer = Arc::new(SqliteAggregateWriter::new(&pipeline_config.db_path)?);
    let provisioner =
        provisioner_from_config(pipeline_config.admin_url.as_deref(), &pipeline_config.db_path)?;

    // Ingestion first, so the log is drained as soon as events arrive
    let (ingest_shutdown_tx, ingest_shutdown_rx) = watch::channel(false);
    let ingester = StreamIngester::new(pipeline_config.clone(), event_log.clone(), db_writer);
    let ingester_handle = match ingester.start(provisioner.as_ref(), ingest_shutdown_rx).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("❌ Ingestion refused to start: {}", e);
            error!("   └─ Run `pitwall_admin ensure` to provision the store");
            return Err(e.into());
        }
    };
    let registry = ingester.registry();

    // Feed side: reader -> bounded queue -> publisher
    let (feed_shutdown_tx, feed_shutdown_rx) = watch::channel(false);
    let flow = Arc::new(FlowControl::new(
        publisher_config.spool_high_water,
        publisher_config.spool_low_water,
    ));
    let (event_tx, event_rx) = mpsc::channel(publisher_config.channel_buffer);
    let (signal_tx, signal_rx) = mpsc::channel(64);

    let publisher = EventPublisher::new(event_log.clone(), publisher_config.clone(), flow.clone())?;
    let publisher_stats = publisher.stats();
    let publisher_handle = tokio::spawn(publisher.run(event_rx, feed_shutdown_rx.clone()));

    let (feed_stats, reader_handle) = match &feed_config.replay_path {
        Some(path) => {
            info!("📼 Replaying recorded feed from {}", path);
            spawn_reader(
                ReplayTransport::from_file(path)?,
                &feed_config,
                flow.clone(),
                event_tx,
                signal_tx,
                feed_shutdown_rx.clone(),
            )
        }
        None => spawn_reader(
            SignalRTransport::new(&feed_config),
            &feed_config,
            flow.clone(),
            event_tx,
            signal_tx,
            feed_shutdown_rx.clone(),
        ),
    };
    tokio::spawn(route_session_signals(signal_rx, registry.clone()));

    // Read side, on its own read-only connection
    let archive = Arc::new(SqliteArchiveReader::open(&pipeline_config.db_path)?);
    let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
    let api_state = Arc::new(ApiState {
        gateway: QueryGateway::new(ingester.snapshots(), registry, Some(archive)),
        poll_interval_ms: query_config.dashboard_poll_ms,
        ingest: ingester.metrics(),
        publisher: Some(publisher_stats),
        feed: Some(feed_stats),
    });
    let api_handle = tokio::spawn(pitwall::query::serve(
        query_config.query_addr,
        api_state,
        api_shutdown_rx,
    ));

    info!("✅ All components running");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    let _ = feed_shutdown_tx.send(true);
    if let Err(e) = reader_handle.await {
        error!("❌ Feed reader task panicked: {}", e);
    }
    match publisher_handle.await {
        Ok(Ok(())) => info!("   ├─ Publisher drained"),
        Ok(Err(e)) => warn!("⚠️  Publisher stopped with error: {}", e),
        Err(e) => error!("❌ Publisher task panicked: {}", e),
    }

    let _ = ingest_shutdown_tx.send(true);
    ingester_handle.join().await;
    info!("   ├─ Ingestion workers flushed");

    let _ = api_shutdown_tx.send(true);
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("⚠️  Query API stopped with error: {}", e),
        Err(e) => error!("❌ Query API task panicked: {}", e),
    }

    info!("✅ Pitwall runtime stopped");
    Ok(())
}
