//! Live timing feed intake
//!
//! - `transport` - SignalR websocket client (and a replay transport)
//! - `decoder` - frame → TelemetryEvent / session signals
//! - `connection` - connection state machine
//! - `gap_tracker` - unresumable outages, as count and duration
//! - `reader` - the reconnecting read loop feeding the publisher queue

pub mod config;
pub mod connection;
pub mod decoder;
pub mod gap_tracker;
pub mod reader;
pub mod transport;

pub use config::FeedConfig;
pub use connection::{ConnectionState, ConnectionTracker};
pub use decoder::{DecodeError, DecodedFrame, FeedItem, FrameDecoder, SessionSignal};
pub use gap_tracker::GapTracker;
pub use reader::{FeedReader, FeedStats, FeedStatsSnapshot};
pub use transport::{FeedTransport, ReplayTransport, SignalRTransport};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid feed URL: {0}")]
    Url(String),

    #[error("negotiation failed: {0}")]
    Negotiate(String),

    #[error("not connected")]
    NotConnected,

    #[error("illegal connection transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
