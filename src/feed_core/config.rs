use crate::config::{list_or, parse_or, string_or, ConfigError, Lookup, ProcessEnv};

/// Feed connection settings
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// SignalR base URL (negotiate/connect/reconnect are appended)
    pub feed_url: String,
    pub hub: String,
    pub topics: Vec<String>,

    /// Session id stamped on events until a SessionInfo frame names one
    pub session_id: String,

    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,

    /// Recorded frames (one per line) to replay instead of the live feed
    pub replay_path: Option<String>,
}

impl FeedConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PITWALL_FEED_URL` (default: https://livetiming.formula1.com/signalr)
    /// - `PITWALL_FEED_HUB` (default: Streaming)
    /// - `PITWALL_FEED_TOPICS` (default: CarData.z,Position.z,TimingData,SessionInfo,SessionStatus)
    /// - `PITWALL_SESSION_ID` (default: live)
    /// - `PITWALL_RECONNECT_INITIAL_MS` (default: 1000)
    /// - `PITWALL_RECONNECT_MAX_MS` (default: 30000)
    /// - `PITWALL_RECONNECT_JITTER_MS` (default: 500)
    /// - `PITWALL_FEED_REPLAY` (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(lookup: &dyn Lookup) -> Result<Self, ConfigError> {
        let config = Self {
            feed_url: string_or(lookup, "PITWALL_FEED_URL", "https://livetiming.formula1.com/signalr"),
            hub: string_or(lookup, "PITWALL_FEED_HUB", "Streaming"),
            topics: list_or(
                lookup,
                "PITWALL_FEED_TOPICS",
                &["CarData.z", "Position.z", "TimingData", "SessionInfo", "SessionStatus"],
            ),
            session_id: string_or(lookup, "PITWALL_SESSION_ID", "live"),
            reconnect_initial_ms: parse_or(lookup, "PITWALL_RECONNECT_INITIAL_MS", 1_000),
            reconnect_max_ms: parse_or(lookup, "PITWALL_RECONNECT_MAX_MS", 30_000),
            reconnect_jitter_ms: parse_or(lookup, "PITWALL_RECONNECT_JITTER_MS", 500),
            replay_path: lookup.get("PITWALL_FEED_REPLAY"),
        };

        if config.topics.is_empty() {
            return Err(ConfigError::InvalidValue(
                "PITWALL_FEED_TOPICS must name at least one topic".to_string(),
            ));
        }
        if config.reconnect_initial_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PITWALL_RECONNECT_INITIAL_MS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}
