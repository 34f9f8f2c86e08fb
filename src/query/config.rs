use crate::config::{parse_or, string_or, ConfigError, Lookup, ProcessEnv};
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub query_addr: SocketAddr,

    /// Polling interval advertised to dashboards in every response
    pub dashboard_poll_ms: u64,
}

impl QueryConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PITWALL_QUERY_ADDR` (default: 127.0.0.1:8080)
    /// - `PITWALL_DASHBOARD_POLL_MS` (default: 3000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(lookup: &dyn Lookup) -> Result<Self, ConfigError> {
        let raw_addr = string_or(lookup, "PITWALL_QUERY_ADDR", "127.0.0.1:8080");
        let query_addr = raw_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue(format!("PITWALL_QUERY_ADDR '{}': {}", raw_addr, e)))?;

        Ok(Self {
            query_addr,
            dashboard_poll_ms: parse_or(lookup, "PITWALL_DASHBOARD_POLL_MS", 3_000),
        })
    }
}
