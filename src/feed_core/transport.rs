//! Feed transports
//!
//! `SignalRTransport` speaks the legacy SignalR protocol used by the live
//! timing service: HTTP negotiate for a connection token, then a websocket on
//! `/connect` (fresh) or `/reconnect?messageId=` (resume after a cursor).

use super::config::FeedConfig;
use super::FeedError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ACCEPT_ENCODING, COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const CLIENT_PROTOCOL: &str = "1.5";

#[async_trait]
pub trait FeedTransport: Send {
    /// Open the stream. With a cursor, try to resume after it.
    ///
    /// Returns `true` when the stream was resumed, `false` for a fresh start.
    async fn connect(&mut self, cursor: Option<&str>) -> Result<bool, FeedError>;

    /// Next text frame; `Ok(None)` once the server ended the stream.
    async fn next_frame(&mut self) -> Result<Option<String>, FeedError>;

    async fn close(&mut self);

    fn describe(&self) -> String;
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SignalRTransport {
    client: reqwest::Client,
    base_url: String,
    hub: String,
    topics: Vec<String>,
    token: Option<String>,
    cookie: Option<String>,
    socket: Option<Socket>,
    invocation: u64,
}

impl SignalRTransport {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.feed_url.trim_end_matches('/').to_string(),
            hub: config.hub.clone(),
            topics: config.topics.clone(),
            token: None,
            cookie: None,
            socket: None,
            invocation: 0,
        }
    }

    fn connection_data(&self) -> String {
        json!([{ "name": self.hub }]).to_string()
    }

    async fn negotiate(&mut self) -> Result<(), FeedError> {
        let mut url = Url::parse(&format!("{}/negotiate", self.base_url))
            .map_err(|e| FeedError::Url(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("connectionData", &self.connection_data())
            .append_pair("clientProtocol", CLIENT_PROTOCOL);

        let response = self.client.get(url).send().await?.error_for_status()?;

        // Load balancer affinity cookies must follow us onto the websocket
        let cookie = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let body: Value = response.json().await?;
        let token = body
            .get("ConnectionToken")
            .and_then(Value::as_str)
            .ok_or_else(|| FeedError::Negotiate("response has no ConnectionToken".to_string()))?;

        self.token = Some(token.to_string());
        self.cookie = (!cookie.is_empty()).then_some(cookie);
        Ok(())
    }

    fn socket_url(&self, endpoint: &str, cursor: Option<&str>) -> Result<String, FeedError> {
        let token = self.token.as_deref().ok_or(FeedError::NotConnected)?;

        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };

        let mut url = Url::parse(&format!("{}/{}", ws_base, endpoint))
            .map_err(|e| FeedError::Url(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("transport", "webSockets")
                .append_pair("connectionToken", token)
                .append_pair("connectionData", &self.connection_data())
                .append_pair("clientProtocol", CLIENT_PROTOCOL);
            if let Some(cursor) = cursor {
                query.append_pair("messageId", cursor);
            }
        }
        Ok(url.to_string())
    }

    async fn open_socket(&mut self, url: &str) -> Result<(), FeedError> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static("BestHTTP"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, identity"));
        if let Some(cookie) = self.cookie.as_deref().and_then(|c| HeaderValue::from_str(c).ok()) {
            headers.insert(COOKIE, cookie);
        }

        let (socket, _response) = connect_async(request).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<(), FeedError> {
        self.invocation += 1;
        let message = json!({
            "H": self.hub,
            "M": "Subscribe",
            "A": [self.topics],
            "I": self.invocation,
        });

        let socket = self.socket.as_mut().ok_or(FeedError::NotConnected)?;
        socket.send(Message::Text(message.to_string())).await?;
        log::info!("   ├─ Subscribed to {} topics", self.topics.len());
        Ok(())
    }
}

#[async_trait]
impl FeedTransport for SignalRTransport {
    async fn connect(&mut self, cursor: Option<&str>) -> Result<bool, FeedError> {
        self.close().await;

        if let (Some(cursor), true) = (cursor, self.token.is_some()) {
            let url = self.socket_url("reconnect", Some(cursor))?;
            match self.open_socket(&url).await {
                Ok(()) => return Ok(true),
                Err(e) => log::warn!("⚠️  Resume from cursor failed ({}), starting fresh", e),
            }
        }

        self.negotiate().await?;
        let url = self.socket_url("connect", None)?;
        self.open_socket(&url).await?;
        self.subscribe().await?;
        Ok(false)
    }

    async fn next_frame(&mut self) -> Result<Option<String>, FeedError> {
        loop {
            let socket = self.socket.as_mut().ok_or(FeedError::NotConnected)?;
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()))
                }
                Some(Ok(Message::Ping(payload))) => socket.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(frame))) => {
                    log::info!("🔌 Feed closed by server: {:?}", frame);
                    self.socket = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(e.into());
                }
                None => {
                    self.socket = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }

    fn describe(&self) -> String {
        format!("signalr:{} ({})", self.base_url, self.hub)
    }
}

/// Plays recorded frames (one per line) as if they came from the live feed.
///
/// A reconnect resumes at the next unplayed frame. After the last frame the
/// stream stays open and idle.
pub struct ReplayTransport {
    frames: Vec<String>,
    position: usize,
    pace: Option<Duration>,
    connected: bool,
    finished_logged: bool,
}

impl ReplayTransport {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            frames,
            position: 0,
            pace: None,
            connected: false,
            finished_logged: false,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::new(
            contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    /// Delay between frames
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl FeedTransport for ReplayTransport {
    async fn connect(&mut self, _cursor: Option<&str>) -> Result<bool, FeedError> {
        self.connected = true;
        Ok(self.position > 0)
    }

    async fn next_frame(&mut self) -> Result<Option<String>, FeedError> {
        if !self.connected {
            return Err(FeedError::NotConnected);
        }

        if let Some(frame) = self.frames.get(self.position) {
            if let Some(pace) = self.pace {
                tokio::time::sleep(pace).await;
            }
            self.position += 1;
            return Ok(Some(frame.clone()));
        }

        if !self.finished_logged {
            log::info!("✅ Replay finished after {} frames", self.frames.len());
            self.finished_logged = true;
        }
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        format!("replay ({} frames)", self.frames.len())
    }
}
