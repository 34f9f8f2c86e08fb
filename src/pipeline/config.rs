//! StreamIngester configuration from environment variables

use super::windows::{WindowMode, WindowSpec};
use crate::config::{list_or, parse_or, string_or, ConfigError, Lookup, ProcessEnv};

/// Configuration for the ingestion runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the SQLite state/aggregate store
    pub db_path: String,

    /// Path to the SQLite event log (broker)
    pub log_path: String,

    /// Remote admin API; `None` means the local SQLite provisioner
    pub admin_url: Option<String>,

    /// Event log topic
    pub topic: String,

    /// Number of log partitions (and ingestion workers)
    pub partitions: u32,

    pub consumer_group: String,

    /// Window geometry (width, slide, mode)
    pub window: WindowSpec,

    /// Allowed lateness subtracted from the max event time to form the watermark
    pub allowed_lateness_ms: i64,

    /// Metrics folded into window aggregates
    pub aggregate_metrics: Vec<String>,

    pub session_inactivity_ms: i64,
    pub session_grace_ms: i64,
    pub session_retention_ms: i64,

    /// Worker poll interval against the event log
    pub poll_interval_ms: u64,

    /// Max records fetched per poll
    pub fetch_batch: usize,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PITWALL_DB_PATH` (default: data/pitwall.db)
    /// - `PITWALL_LOG_PATH` (default: data/eventlog.db)
    /// - `PITWALL_ADMIN_URL` (default: unset)
    /// - `PITWALL_TOPIC` (default: f1-telemetry)
    /// - `PITWALL_PARTITIONS` (default: 8)
    /// - `PITWALL_CONSUMER_GROUP` (default: pitwall-ingester)
    /// - `PITWALL_WINDOW_WIDTH_MS` (default: 60000)
    /// - `PITWALL_WINDOW_MODE` (default: tumbling)
    /// - `PITWALL_WINDOW_SLIDE_MS` (default: 15000, sliding only)
    /// - `PITWALL_ALLOWED_LATENESS_MS` (default: 5000)
    /// - `PITWALL_AGGREGATE_METRICS` (default: speed,rpm,throttle,brake,lapTime)
    /// - `PITWALL_SESSION_INACTIVITY_MS` (default: 300000)
    /// - `PITWALL_SESSION_GRACE_MS` (default: 10000)
    /// - `PITWALL_SESSION_RETENTION_MS` (default: 3600000)
    /// - `PITWALL_POLL_INTERVAL_MS` (default: 100)
    /// - `PITWALL_FETCH_BATCH` (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(lookup: &dyn Lookup) -> Result<Self, ConfigError> {
        let width_ms = parse_or::<i64>(lookup, "PITWALL_WINDOW_WIDTH_MS", 60_000);
        let mode_raw = string_or(lookup, "PITWALL_WINDOW_MODE", "tumbling");
        let mode = WindowMode::parse(&mode_raw).ok_or_else(|| {
            ConfigError::InvalidValue(format!("PITWALL_WINDOW_MODE '{}'", mode_raw))
        })?;
        let window = match mode {
            WindowMode::Tumbling => WindowSpec::tumbling(width_ms),
            WindowMode::Sliding => WindowSpec::sliding(
                width_ms,
                parse_or::<i64>(lookup, "PITWALL_WINDOW_SLIDE_MS", 15_000),
            ),
        };

        let config = Self {
            db_path: string_or(lookup, "PITWALL_DB_PATH", "data/pitwall.db"),
            log_path: string_or(lookup, "PITWALL_LOG_PATH", "data/eventlog.db"),
            admin_url: lookup.get("PITWALL_ADMIN_URL"),
            topic: string_or(lookup, "PITWALL_TOPIC", "f1-telemetry"),
            partitions: parse_or(lookup, "PITWALL_PARTITIONS", 8),
            consumer_group: string_or(lookup, "PITWALL_CONSUMER_GROUP", "pitwall-ingester"),
            window,
            allowed_lateness_ms: parse_or(lookup, "PITWALL_ALLOWED_LATENESS_MS", 5_000),
            aggregate_metrics: list_or(
                lookup,
                "PITWALL_AGGREGATE_METRICS",
                &["speed", "rpm", "throttle", "brake", "lapTime"],
            ),
            session_inactivity_ms: parse_or(lookup, "PITWALL_SESSION_INACTIVITY_MS", 300_000),
            session_grace_ms: parse_or(lookup, "PITWALL_SESSION_GRACE_MS", 10_000),
            session_retention_ms: parse_or(lookup, "PITWALL_SESSION_RETENTION_MS", 3_600_000),
            poll_interval_ms: parse_or(lookup, "PITWALL_POLL_INTERVAL_MS", 100),
            fetch_batch: parse_or(lookup, "PITWALL_FETCH_BATCH", 500),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate().map_err(ConfigError::InvalidValue)?;

        if self.partitions == 0 {
            return Err(ConfigError::InvalidValue(
                "PITWALL_PARTITIONS must be at least 1".to_string(),
            ));
        }
        if self.allowed_lateness_ms < 0 {
            return Err(ConfigError::InvalidValue(
                "PITWALL_ALLOWED_LATENESS_MS must not be negative".to_string(),
            ));
        }
        if self.session_grace_ms < 0 || self.session_inactivity_ms <= 0 {
            return Err(ConfigError::InvalidValue(
                "session inactivity must be positive and grace non-negative".to_string(),
            ));
        }
        if self.fetch_batch == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PITWALL_FETCH_BATCH and PITWALL_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/pitwall.db".to_string(),
            log_path: "data/eventlog.db".to_string(),
            admin_url: None,
            topic: "f1-telemetry".to_string(),
            partitions: 8,
            consumer_group: "pitwall-ingester".to_string(),
            window: WindowSpec::tumbling(60_000),
            allowed_lateness_ms: 5_000,
            aggregate_metrics: ["speed", "rpm", "throttle", "brake", "lapTime"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            session_inactivity_ms: 300_000,
            session_grace_ms: 10_000,
            session_retention_ms: 3_600_000,
            poll_interval_ms: 100,
            fetch_batch: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let env: HashMap<&str, &str> = HashMap::new();
        let config = PipelineConfig::from_lookup(&env).unwrap();

        assert_eq!(config.db_path, "data/pitwall.db");
        assert_eq!(config.partitions, 8);
        assert_eq!(config.window, WindowSpec::tumbling(60_000));
        assert_eq!(config.allowed_lateness_ms, 5_000);
        assert_eq!(config.aggregate_metrics.len(), 5);
        assert!(config.admin_url.is_none());
    }

    #[test]
    fn test_custom_config() {
        let env: HashMap<&str, &str> = [
            ("PITWALL_PARTITIONS", "4"),
            ("PITWALL_WINDOW_MODE", "sliding"),
            ("PITWALL_WINDOW_WIDTH_MS", "10000"),
            ("PITWALL_WINDOW_SLIDE_MS", "5000"),
            ("PITWALL_AGGREGATE_METRICS", "speed"),
            ("PITWALL_ADMIN_URL", "http://admin:9000"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::from_lookup(&env).unwrap();

        assert_eq!(config.partitions, 4);
        assert_eq!(config.window, WindowSpec::sliding(10_000, 5_000));
        assert_eq!(config.aggregate_metrics, vec!["speed"]);
        assert_eq!(config.admin_url.as_deref(), Some("http://admin:9000"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let env: HashMap<&str, &str> = [("PITWALL_WINDOW_MODE", "hopping")].into_iter().collect();
        assert!(matches!(
            PipelineConfig::from_lookup(&env),
            Err(ConfigError::InvalidValue(_))
        ));

        let env: HashMap<&str, &str> = [
            ("PITWALL_WINDOW_MODE", "sliding"),
            ("PITWALL_WINDOW_WIDTH_MS", "1000"),
            ("PITWALL_WINDOW_SLIDE_MS", "5000"),
        ]
        .into_iter()
        .collect();
        assert!(PipelineConfig::from_lookup(&env).is_err());

        let env: HashMap<&str, &str> = [("PITWALL_PARTITIONS", "0")].into_iter().collect();
        assert!(PipelineConfig::from_lookup(&env).is_err());
    }
}
