use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Capped exponential backoff with optional jitter, in milliseconds.
///
/// `max_retries: None` retries forever (feed reconnects); a bound is used
/// for publish attempts that fall back to the spool.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: u64,
    max_delay: u64,
    max_retries: Option<u32>,
    jitter: u64,
    current_attempt: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay: initial_ms,
            max_delay: max_ms.max(initial_ms),
            max_retries: Some(retries),
            jitter: 0,
            current_attempt: 0,
        }
    }

    pub fn unbounded(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries: None,
            ..Self::new(initial_ms, max_ms, 0)
        }
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter = jitter_ms;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn exhausted(&self) -> bool {
        self.max_retries
            .map_or(false, |max| self.current_attempt >= max)
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 1u64.checked_shl(self.current_attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        Duration::from_millis(delay)
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.jitter > 0 {
            rand::thread_rng().gen_range(0..=self.jitter)
        } else {
            0
        };
        self.base_delay() + Duration::from_millis(jitter)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.exhausted() {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();
        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {}ms",
                self.current_attempt + 1,
                max,
                delay.as_millis()
            ),
            None => log::warn!(
                "⏳ Retry attempt {} in {}ms",
                self.current_attempt + 1,
                delay.as_millis()
            ),
        }

        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
