use crate::config::{parse_or, string_or, ConfigError, Lookup, ProcessEnv};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Capacity of the reader → publisher queue
    pub channel_buffer: usize,

    /// Events per append; a partial batch goes out on the linger tick
    pub publish_batch: usize,
    pub linger_ms: u64,

    /// Attempts per batch before spooling
    pub retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,

    pub spool_path: String,
    pub spool_high_water: usize,
    pub spool_low_water: usize,
}

impl PublisherConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PITWALL_CHANNEL_BUFFER` (default: 10000)
    /// - `PITWALL_PUBLISH_BATCH` (default: 256)
    /// - `PITWALL_PUBLISH_LINGER_MS` (default: 50)
    /// - `PITWALL_PUBLISH_RETRIES` (default: 5)
    /// - `PITWALL_PUBLISH_BACKOFF_INITIAL_MS` (default: 100)
    /// - `PITWALL_PUBLISH_BACKOFF_MAX_MS` (default: 5000)
    /// - `PITWALL_SPOOL_PATH` (default: data/spool/events.jsonl)
    /// - `PITWALL_SPOOL_HIGH_WATER` (default: 50000)
    /// - `PITWALL_SPOOL_LOW_WATER` (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(lookup: &dyn Lookup) -> Result<Self, ConfigError> {
        let config = Self {
            channel_buffer: parse_or(lookup, "PITWALL_CHANNEL_BUFFER", 10_000),
            publish_batch: parse_or(lookup, "PITWALL_PUBLISH_BATCH", 256),
            linger_ms: parse_or(lookup, "PITWALL_PUBLISH_LINGER_MS", 50),
            retries: parse_or(lookup, "PITWALL_PUBLISH_RETRIES", 5),
            backoff_initial_ms: parse_or(lookup, "PITWALL_PUBLISH_BACKOFF_INITIAL_MS", 100),
            backoff_max_ms: parse_or(lookup, "PITWALL_PUBLISH_BACKOFF_MAX_MS", 5_000),
            spool_path: string_or(lookup, "PITWALL_SPOOL_PATH", "data/spool/events.jsonl"),
            spool_high_water: parse_or(lookup, "PITWALL_SPOOL_HIGH_WATER", 50_000),
            spool_low_water: parse_or(lookup, "PITWALL_SPOOL_LOW_WATER", 10_000),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_buffer == 0 || self.publish_batch == 0 || self.linger_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "channel buffer, publish batch and linger must be positive".to_string(),
            ));
        }
        if self.spool_low_water > self.spool_high_water {
            return Err(ConfigError::InvalidValue(format!(
                "PITWALL_SPOOL_LOW_WATER ({}) exceeds PITWALL_SPOOL_HIGH_WATER ({})",
                self.spool_low_water, self.spool_high_water
            )));
        }
        Ok(())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 10_000,
            publish_batch: 256,
            linger_ms: 50,
            retries: 5,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
            spool_path: "data/spool/events.jsonl".to_string(),
            spool_high_water: 50_000,
            spool_low_water: 10_000,
        }
    }
}
