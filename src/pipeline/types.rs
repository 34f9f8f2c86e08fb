//! Telemetry event model shared by the feed reader, publisher and ingester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wall-clock source in epoch milliseconds, injectable for tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// One observation of one metric for one car.
///
/// This is also the event log record schema, so field names are fixed:
/// `{sessionId, carNumber, timestampMonotonic, eventTimeUtc, metricName, value}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub session_id: String,
    pub car_number: String,
    /// Feed-assigned, strictly increasing per car/metric source.
    pub timestamp_monotonic: u64,
    pub event_time_utc: DateTime<Utc>,
    pub metric_name: String,
    pub value: String,
}

impl TelemetryEvent {
    pub fn new(
        session_id: impl Into<String>,
        car_number: impl Into<String>,
        metric_name: impl Into<String>,
        value: impl Into<String>,
        timestamp_monotonic: u64,
        event_time_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            car_number: car_number.into(),
            timestamp_monotonic,
            event_time_utc,
            metric_name: metric_name.into(),
            value: value.into(),
        }
    }

    /// Event time in milliseconds since the UNIX epoch.
    pub fn event_time_ms(&self) -> i64 {
        self.event_time_utc.timestamp_millis()
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(self.car_number.clone(), self.metric_name.clone())
    }

    pub fn numeric_value(&self) -> Option<f64> {
        parse_metric_value(&self.value)
    }
}

/// Key of a current-state entry inside one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub car_number: String,
    pub metric_name: String,
}

impl StateKey {
    pub fn new(car_number: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            car_number: car_number.into(),
            metric_name: metric_name.into(),
        }
    }
}

/// Numeric reading of a metric value.
///
/// Plain numbers (`"210"`, `"+1.234"`) parse directly; lap-time style values
/// (`"1:32.456"`, `"1:02:03.5"`) become seconds. Anything else is `None`.
pub fn parse_metric_value(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = trimmed.parse::<f64>() {
        return value.is_finite().then_some(value);
    }

    if trimmed.contains(':') {
        let mut seconds = 0.0;
        for part in trimmed.split(':') {
            let component = part.parse::<f64>().ok()?;
            if component < 0.0 {
                return None;
            }
            seconds = seconds * 60.0 + component;
        }
        return seconds.is_finite().then_some(seconds);
    }

    None
}

/// Builds a UTC timestamp from epoch milliseconds (test and decoder helper).
pub fn utc_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_log_schema_names() {
        let event = TelemetryEvent::new("9523", "44", "speed", "210", 100, utc_from_millis(1_000));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["sessionId"], "9523");
        assert_eq!(json["carNumber"], "44");
        assert_eq!(json["timestampMonotonic"], 100);
        assert_eq!(json["metricName"], "speed");
        assert_eq!(json["value"], "210");
        assert!(json["eventTimeUtc"].as_str().unwrap().starts_with("1970-01-01T00:00:01"));
    }

    #[test]
    fn test_parse_metric_value() {
        assert_eq!(parse_metric_value("210"), Some(210.0));
        assert_eq!(parse_metric_value(" +1.5 "), Some(1.5));
        assert_eq!(parse_metric_value("1:32.456"), Some(92.456));
        assert_eq!(parse_metric_value("1:00:00"), Some(3600.0));
        assert_eq!(parse_metric_value("OnTrack"), None);
        assert_eq!(parse_metric_value("1 LAP"), None);
        assert_eq!(parse_metric_value(""), None);
        assert_eq!(parse_metric_value("NaN"), None);
    }
}
