//! # Ingestion pipeline
//!
//! Consumes the partitioned event log and maintains, per session:
//! - current state: latest value per `(car, metric)` by monotonic timestamp
//! - windowed aggregates (count/sum/min/max) closed by an event-time watermark
//!
//! ## Module Organization
//!
//! - `types` - TelemetryEvent, StateKey, clocks
//! - `state` - last-writer-wins current state
//! - `windows` - tumbling/sliding window bookkeeping
//! - `session` - session lifecycle and shared watermark
//! - `engine` - per-partition apply loop
//! - `snapshot` - copy-on-write views for readers
//! - `db` - SQLite persistence of state and windows
//! - `ingestion` - StreamIngester worker tasks

pub mod config;
pub mod db;
pub mod engine;
pub mod ingestion;
pub mod metrics;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod types;
pub mod windows;

pub use config::PipelineConfig;
pub use db::{AggregateDbWriter, DbError, SqliteAggregateWriter, SqliteArchiveReader};
pub use engine::PartitionEngine;
pub use ingestion::{IngestError, IngesterHandle, StreamIngester};
pub use metrics::{IngestMetrics, IngestMetricsSnapshot};
pub use session::{SessionRegistry, SessionStatus, SessionView};
pub use snapshot::{SnapshotStore, StoreView};
pub use state::{CurrentState, CurrentStateRecord};
pub use types::TelemetryEvent;
pub use windows::{WindowAggregateRecord, WindowMode, WindowSpec};
