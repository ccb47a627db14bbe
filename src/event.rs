//! Inbound event and outbound payload
//!
//! The triggering event arrives as JSON from the invoking platform. It
//! is parsed once, kept as the complete original value, and never
//! mutated; the outbound payload is derived from it deterministically.
//! Fields the source omits default to the literal string `"unknown"`,
//! except the timestamp which defaults to the current time.

use std::time::SystemTime;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Default for every missing string field except the timestamp
const UNKNOWN: &str = "unknown";

/// The pipeline state-change event that triggered this invocation.
///
/// Read-only: accessors extract the fields the bridge republishes, the
/// full original value rides along untouched as `raw` in the payload.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    raw: Value,
}

impl InboundEvent {
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    /// Parse an event from its JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            raw: serde_json::from_slice(bytes)?,
        })
    }

    /// The complete original event value
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn source(&self) -> &str {
        self.str_field("source").unwrap_or(UNKNOWN)
    }

    pub fn detail_type(&self) -> &str {
        self.str_field("detail-type").unwrap_or(UNKNOWN)
    }

    /// `detail.pipeline`, the subject of the state change
    pub fn pipeline(&self) -> &str {
        self.detail_field("pipeline").unwrap_or(UNKNOWN)
    }

    /// `detail.state`, the new pipeline state
    pub fn state(&self) -> &str {
        self.detail_field("state").unwrap_or(UNKNOWN)
    }

    /// Event timestamp. A non-string JSON value is carried as its
    /// serialization; only an absent or null `time` yields `None`.
    pub fn time(&self) -> Option<String> {
        match self.raw.get("time") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    fn detail_field(&self, key: &str) -> Option<&str> {
        self.raw.get("detail").and_then(|d| d.get(key)).and_then(Value::as_str)
    }
}

/// The message body published to the broker, built exactly once per
/// invocation and immutable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundPayload {
    #[serde(rename = "eventSource")]
    pub event_source: String,
    #[serde(rename = "detailType")]
    pub detail_type: String,
    pub subject: String,
    pub state: String,
    pub time: String,
    pub raw: Value,
}

impl OutboundPayload {
    pub fn from_event(event: &InboundEvent) -> Self {
        let time = event
            .time()
            .unwrap_or_else(|| humantime::format_rfc3339_seconds(SystemTime::now()).to_string());

        Self {
            event_source: event.source().to_string(),
            detail_type: event.detail_type().to_string(),
            subject: event.pipeline().to_string(),
            state: event.state().to_string(),
            time,
            raw: event.raw().clone(),
        }
    }

    /// UTF-8 JSON bytes of the payload
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload_json(event: Value) -> Value {
        let payload = OutboundPayload::from_event(&InboundEvent::from_value(event));
        serde_json::to_value(&payload).unwrap()
    }

    #[test]
    fn full_event_maps_every_field() {
        let event = json!({
            "source": "aws.codepipeline",
            "detail-type": "CodePipeline Pipeline Execution State Change",
            "detail": { "pipeline": "Demo", "state": "SUCCEEDED" },
            "time": "2025-01-01T00:00:00Z"
        });

        let out = payload_json(event.clone());
        assert_eq!(
            out,
            json!({
                "eventSource": "aws.codepipeline",
                "detailType": "CodePipeline Pipeline Execution State Change",
                "subject": "Demo",
                "state": "SUCCEEDED",
                "time": "2025-01-01T00:00:00Z",
                "raw": event
            })
        );
    }

    #[test]
    fn missing_fields_default_to_unknown() {
        let out = payload_json(json!({ "time": "2025-01-01T00:00:00Z" }));
        assert_eq!(out["eventSource"], "unknown");
        assert_eq!(out["detailType"], "unknown");
        assert_eq!(out["subject"], "unknown");
        assert_eq!(out["state"], "unknown");
    }

    #[test]
    fn partial_detail_defaults_the_rest() {
        let out = payload_json(json!({
            "detail": { "pipeline": "Demo" },
            "time": "2025-01-01T00:00:00Z"
        }));
        assert_eq!(out["subject"], "Demo");
        assert_eq!(out["state"], "unknown");
    }

    #[test]
    fn non_string_fields_are_not_strings_so_default_applies() {
        let out = payload_json(json!({
            "source": 42,
            "detail": { "pipeline": ["not", "a", "string"] },
            "time": "2025-01-01T00:00:00Z"
        }));
        assert_eq!(out["eventSource"], "unknown");
        assert_eq!(out["subject"], "unknown");
    }

    #[test]
    fn missing_time_defaults_to_now_in_rfc3339() {
        let out = payload_json(json!({}));
        let time = out["time"].as_str().unwrap();
        humantime::parse_rfc3339(time).expect("default time must be RFC 3339");
    }

    #[test]
    fn null_time_also_defaults() {
        let out = payload_json(json!({ "time": null }));
        assert!(out["time"].as_str().is_some());
        assert_ne!(out["time"], json!(null));
    }

    #[test]
    fn numeric_time_carried_as_its_serialization() {
        let out = payload_json(json!({ "time": 1735689600 }));
        assert_eq!(out["time"], "1735689600");
    }

    #[test]
    fn raw_round_trips_byte_identically() {
        let event = json!({
            "source": "aws.codepipeline",
            "detail-type": "x",
            "detail": { "pipeline": "P", "state": "FAILED", "extra": { "nested": [1, 2, 3] } },
            "time": "2025-06-05T12:00:00Z",
            "unrelated": true
        });

        let payload = OutboundPayload::from_event(&InboundEvent::from_value(event.clone()));
        let bytes = payload.to_bytes().unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed["raw"], event);
    }
}
