//! Live timing frame decoder
//!
//! Frame shapes (legacy SignalR):
//! - `{}` keep-alive
//! - `{"C": cursor, "M": [{"H": hub, "M": "feed", "A": [topic, payload, utc]}]}`
//! - `{"R": {topic: payload, ...}, "I": id}` reply to `Subscribe` (initial state)
//! - a bare TelemetryEvent record, accepted as-is
//!
//! `.z` topics carry base64 raw-deflate JSON.

use crate::pipeline::types::TelemetryEvent;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use serde_json::Value;
use std::io::Read;

/// CarData channel → metric name
const CAR_CHANNELS: [(&str, &str); 6] = [
    ("0", "rpm"),
    ("2", "speed"),
    ("3", "gear"),
    ("4", "throttle"),
    ("5", "brake"),
    ("45", "drs"),
];

/// SessionStatus values that end a session
const END_STATUSES: [&str; 2] = ["Finalised", "Ends"];

/// Topics that change which session subsequent data belongs to
const SESSION_TOPICS: [&str; 2] = ["SessionInfo", "SessionStatus"];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Started(String),
    Ended(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Telemetry(TelemetryEvent),
    Session(SessionSignal),
}

#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Message cursor to resume from, when the frame carried one
    pub cursor: Option<String>,
    pub items: Vec<FeedItem>,
    /// Topics present in the frame that this decoder does not handle
    pub ignored_topics: usize,
}

pub struct FrameDecoder {
    session_id: String,
}

impl FrameDecoder {
    pub fn new(initial_session_id: &str) -> Self {
        Self {
            session_id: initial_session_id.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Decode one text frame. `received_at` stands in for entries that carry
    /// no timestamp of their own.
    pub fn decode(&mut self, text: &str, received_at: DateTime<Utc>) -> Result<DecodedFrame, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or_else(|| DecodeError::Malformed("frame is not an object".to_string()))?;

        let mut frame = DecodedFrame::default();

        if object.contains_key("sessionId") && object.contains_key("carNumber") {
            let event: TelemetryEvent = serde_json::from_value(value.clone())?;
            frame.items.push(FeedItem::Telemetry(event));
            return Ok(frame);
        }

        frame.cursor = object.get("C").and_then(Value::as_str).map(str::to_string);

        if let Some(messages) = object.get("M") {
            let messages = messages
                .as_array()
                .ok_or_else(|| DecodeError::Malformed("'M' is not an array".to_string()))?;
            for message in messages {
                if message.get("M").and_then(Value::as_str) != Some("feed") {
                    continue;
                }
                let args = message
                    .get("A")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DecodeError::Malformed("feed message without 'A'".to_string()))?;
                let topic = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| DecodeError::Malformed("feed message without topic".to_string()))?;
                let payload = args.get(1).unwrap_or(&Value::Null);
                let at = args
                    .get(2)
                    .and_then(Value::as_str)
                    .and_then(parse_utc)
                    .unwrap_or(received_at);
                self.decode_topic(topic, payload, at, &mut frame)?;
            }
        }

        // Session topics first, so data topics carry the new session id
        if let Some(Value::Object(initial)) = object.get("R") {
            let (session, data): (Vec<_>, Vec<_>) = initial
                .iter()
                .partition(|(topic, _)| SESSION_TOPICS.contains(&topic.as_str()));
            for (topic, payload) in session.into_iter().chain(data) {
                self.decode_topic(topic, payload, received_at, &mut frame)?;
            }
        }

        Ok(frame)
    }

    fn decode_topic(
        &mut self,
        topic: &str,
        payload: &Value,
        at: DateTime<Utc>,
        frame: &mut DecodedFrame,
    ) -> Result<(), DecodeError> {
        match topic {
            "CarData.z" => self.car_data(&inflate(payload)?, &mut frame.items),
            "Position.z" => self.position(&inflate(payload)?, &mut frame.items),
            "TimingData" => self.timing(payload, at, &mut frame.items),
            "SessionInfo" => self.session_info(payload, &mut frame.items),
            "SessionStatus" => self.session_status(payload, &mut frame.items),
            other => {
                log::debug!("Ignoring topic {}", other);
                frame.ignored_topics += 1;
            }
        }
        Ok(())
    }

    fn car_data(&self, payload: &Value, items: &mut Vec<FeedItem>) {
        let entries = payload.get("Entries").and_then(Value::as_array);
        for entry in entries.into_iter().flatten() {
            let Some(at) = entry.get("Utc").and_then(Value::as_str).and_then(parse_utc) else {
                continue;
            };
            let Some(cars) = entry.get("Cars").and_then(Value::as_object) else {
                continue;
            };
            for (car, data) in cars {
                let Some(channels) = data.get("Channels").and_then(Value::as_object) else {
                    continue;
                };
                for (channel, metric) in CAR_CHANNELS {
                    if let Some(value) = channels.get(channel).and_then(scalar) {
                        items.push(self.event(car, metric, value, at));
                    }
                }
            }
        }
    }

    fn position(&self, payload: &Value, items: &mut Vec<FeedItem>) {
        let samples = payload.get("Position").and_then(Value::as_array);
        for sample in samples.into_iter().flatten() {
            let Some(at) = sample.get("Timestamp").and_then(Value::as_str).and_then(parse_utc) else {
                continue;
            };
            let Some(entries) = sample.get("Entries").and_then(Value::as_object) else {
                continue;
            };
            for (car, coords) in entries {
                for (field, metric) in [("X", "x"), ("Y", "y"), ("Z", "z")] {
                    if let Some(value) = coords.get(field).and_then(scalar) {
                        items.push(self.event(car, metric, value, at));
                    }
                }
            }
        }
    }

    fn timing(&self, payload: &Value, at: DateTime<Utc>, items: &mut Vec<FeedItem>) {
        let Some(lines) = payload.get("Lines").and_then(Value::as_object) else {
            return;
        };
        for (car, line) in lines {
            let fields = [
                ("position", line.get("Position")),
                ("lapTime", line.get("LastLapTime").and_then(|l| l.get("Value"))),
                ("gapToLeader", line.get("GapToLeader")),
            ];
            for (metric, raw) in fields {
                if let Some(value) = raw.and_then(scalar).filter(|v| !v.is_empty()) {
                    items.push(self.event(car, metric, value, at));
                }
            }
        }
    }

    fn session_info(&mut self, payload: &Value, items: &mut Vec<FeedItem>) {
        let Some(key) = payload.get("Key").and_then(scalar) else {
            return;
        };
        if key != self.session_id {
            log::info!("🏁 Session {} ({})", key, describe_session(payload));
            self.session_id = key.clone();
            items.push(FeedItem::Session(SessionSignal::Started(key)));
        }
    }

    fn session_status(&self, payload: &Value, items: &mut Vec<FeedItem>) {
        let status = payload.get("Status").and_then(Value::as_str).unwrap_or_default();
        if END_STATUSES.contains(&status) {
            log::info!("🏁 Session {} status {}", self.session_id, status);
            items.push(FeedItem::Session(SessionSignal::Ended(self.session_id.clone())));
        }
    }

    fn event(&self, car: &str, metric: &str, value: String, at: DateTime<Utc>) -> FeedItem {
        let micros = at.timestamp_micros().max(0) as u64;
        FeedItem::Telemetry(TelemetryEvent::new(
            self.session_id.clone(),
            car,
            metric,
            value,
            micros,
            at,
        ))
    }
}

/// base64 + raw deflate → JSON
fn inflate(payload: &Value) -> Result<Value, DecodeError> {
    let encoded = payload
        .as_str()
        .ok_or_else(|| DecodeError::Malformed("compressed payload is not a string".to_string()))?;
    let compressed = STANDARD.decode(encoded.trim())?;

    let mut json = String::new();
    DeflateDecoder::new(compressed.as_slice()).read_to_string(&mut json)?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Numbers and strings as metric values; anything else is skipped.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn describe_session(payload: &Value) -> String {
    let meeting = payload
        .get("Meeting")
        .and_then(|m| m.get("Name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown meeting");
    let name = payload.get("Name").and_then(Value::as_str).unwrap_or("unknown");
    format!("{} - {}", meeting, name)
}
