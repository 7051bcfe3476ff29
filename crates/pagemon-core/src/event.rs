//! The monitoring event record and its wire encoding.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used on the wire: ISO 8601, UTC, whole seconds.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One successful observation of the monitored endpoint.
///
/// Created by the prober, consumed once by the publisher, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    /// When the probe completed (UTC, second precision).
    #[serde(rename = "ts", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// The probed endpoint.
    #[serde(rename = "page_url")]
    pub url: String,
    /// HTTP status returned by the endpoint.
    #[serde(rename = "http_code")]
    pub http_status: u16,
    /// Elapsed time from request start to response head.
    #[serde(with = "micros")]
    pub response_time: Duration,
}

impl MonitoringEvent {
    /// Build an event stamped with the current UTC time.
    pub fn now(url: impl Into<String>, http_status: u16, response_time: Duration) -> Self {
        Self::at(Utc::now(), url, http_status, response_time)
    }

    /// Build an event with an explicit timestamp, truncated to whole seconds.
    pub fn at(
        timestamp: DateTime<Utc>,
        url: impl Into<String>,
        http_status: u16,
        response_time: Duration,
    ) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            url: url.into(),
            http_status,
            // Microsecond resolution on the wire.
            response_time: Duration::from_micros(saturating_micros(response_time)),
        }
    }

    /// Response time in whole microseconds.
    pub fn response_time_micros(&self) -> u64 {
        saturating_micros(self.response_time)
    }

    /// Partition key for the broker: the probed URL.
    pub fn key(&self) -> &[u8] {
        self.url.as_bytes()
    }

    /// Serialize to the flat JSON object published to the broker.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

fn saturating_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::saturating_micros(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> MonitoringEvent {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap();
        MonitoringEvent::at(
            ts,
            "https://example.test/health",
            200,
            Duration::from_millis(120),
        )
    }

    #[test]
    fn json_uses_flat_wire_names() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["ts"], "2024-03-09T17:04:05Z");
        assert_eq!(json["page_url"], "https://example.test/health");
        assert_eq!(json["http_code"], 200);
        assert_eq!(json["response_time"], 120_000);
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn timestamp_is_truncated_to_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap()
            + chrono::Duration::milliseconds(987);
        let event = MonitoringEvent::at(ts, "http://a", 204, Duration::ZERO);
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 0);
        assert_eq!(event.timestamp.timestamp(), ts.timestamp());
    }

    #[test]
    fn response_time_keeps_whole_seconds() {
        let event = MonitoringEvent::at(
            Utc::now(),
            "http://a",
            200,
            Duration::from_micros(2_345_678),
        );
        assert_eq!(event.response_time_micros(), 2_345_678);
    }

    #[test]
    fn sub_microsecond_precision_is_dropped() {
        let event = MonitoringEvent::at(Utc::now(), "http://a", 200, Duration::from_nanos(1_999));
        assert_eq!(event.response_time, Duration::from_micros(1));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let event = sample();
        let back: MonitoringEvent = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn key_is_the_url() {
        assert_eq!(sample().key(), b"https://example.test/health");
    }
}
