//! Event publishing: partitioned log adapters, local spool and the batching
//! publisher that feeds them.

pub mod config;
pub mod event_publisher;
pub mod flow;
pub mod log;
pub mod partition;
pub mod spool;
pub mod sqlite_log;

pub use config::PublisherConfig;
pub use event_publisher::{EventPublisher, PublishError, PublisherStats, PublisherStatsSnapshot};
pub use flow::FlowControl;
pub use self::log::{EventLog, LogEntry, LogError, MemoryEventLog};
pub use partition::partition_for;
pub use spool::{Spool, SpoolError};
pub use sqlite_log::SqliteEventLog;
