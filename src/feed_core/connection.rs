use super::FeedError;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

impl ConnectionState {
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Streaming)
                | (Connecting, Backoff)
                | (Streaming, Backoff)
                | (Backoff, Connecting)
                | (Disconnected | Connecting | Streaming | Backoff, Stopped)
        )
    }
}

/// Current connection state plus when it was entered.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: ConnectionState,
    since: Instant,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            since: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn since(&self) -> Instant {
        self.since
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), FeedError> {
        if !self.state.can_transition_to(next) {
            return Err(FeedError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Feed connection {:?} -> {:?}", self.state, next);
        self.state = next;
        self.since = Instant::now();
        Ok(())
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
