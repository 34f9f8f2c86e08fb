//! Read side: snapshot-isolated queries and the dashboard HTTP API.

pub mod config;
pub mod gateway;
pub mod http;

pub use config::QueryConfig;
pub use gateway::{DataSource, QueryError, QueryGateway, SessionSnapshotView, SessionSummary};
pub use http::{router, serve, ApiState};
