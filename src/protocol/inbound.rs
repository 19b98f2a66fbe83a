//! # Inbound Event Decoding
//!
//! Turns a raw text frame from the carrier into an [`InboundEvent`].
//!
//! ## Decoding Rules:
//! 1. **Unparsable text** (not JSON, or JSON that is not an object) is the only hard
//!    failure and yields `SessionError::MalformedMessage`
//! 2. **Unrecognized tags** decode to `InboundEvent::Unknown`
//! 3. **Recognized tags missing a required field** (a `media` frame without a payload,
//!    a `dtmf` frame without a digit) also decode to `Unknown`, so partial or variant
//!    carrier payloads never tear down a session
//!
//! ## Rust Concepts:
//! - **serde(untagged)**: [`Scalar`] accepts either a JSON number or a JSON string
//!   and remembers which one it was, so echoes keep the carrier's original types
//! - **let-else**: Early return when a pattern does not match

use crate::error::SessionError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A carrier field that may arrive as either a number or a string.
///
/// `chunk`, `timestamp`, `duration` and `sequence_number` are sent both ways depending
/// on the carrier and the call leg. We never interpret them, we only pass them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

/// One chunk of caller audio.
///
/// The payload stays in its encoded wire form. Nothing in this service decodes audio.
/// Any other fields the carrier puts in the media object are kept in `extra` and
/// echoed back untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioFrame {
    #[serde(default)]
    pub chunk: Option<Scalar>,
    #[serde(default)]
    pub timestamp: Option<Scalar>,
    pub payload: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AudioFrame {
    /// Size of the encoded payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Chunk identifier for log lines, `N/A` when the carrier sent none.
    pub fn chunk_label(&self) -> String {
        self.chunk
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    }
}

/// Identity and endpoint details carried by a `start` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartInfo {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub media_format: Option<Value>,
}

/// A decoded carrier event.
///
/// Each variant carries only what that event needs. Events are consumed by a single
/// dispatch and never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Start(StartInfo),
    Media {
        stream_sid: Option<String>,
        sequence_number: Option<Scalar>,
        frame: AudioFrame,
    },
    Dtmf {
        stream_sid: Option<String>,
        digit: String,
        duration: Option<Scalar>,
    },
    Mark {
        stream_sid: Option<String>,
        name: String,
    },
    Clear {
        stream_sid: Option<String>,
    },
    Stop {
        call_sid: Option<String>,
        account_sid: Option<String>,
        reason: Option<String>,
    },
    /// Unrecognized tag, missing tag, or a known tag without its required fields.
    Unknown {
        event: Option<String>,
    },
}

/// Event tag without the payload, used for logging and monitor records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Start,
    Media,
    Dtmf,
    Mark,
    Clear,
    Stop,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Start => "start",
            EventKind::Media => "media",
            EventKind::Dtmf => "dtmf",
            EventKind::Mark => "mark",
            EventKind::Clear => "clear",
            EventKind::Stop => "stop",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Connected => EventKind::Connected,
            InboundEvent::Start(_) => EventKind::Start,
            InboundEvent::Media { .. } => EventKind::Media,
            InboundEvent::Dtmf { .. } => EventKind::Dtmf,
            InboundEvent::Mark { .. } => EventKind::Mark,
            InboundEvent::Clear { .. } => EventKind::Clear,
            InboundEvent::Stop { .. } => EventKind::Stop,
            InboundEvent::Unknown { .. } => EventKind::Unknown,
        }
    }
}

#[derive(Deserialize)]
struct DtmfBody {
    digit: String,
    #[serde(default)]
    duration: Option<Scalar>,
}

#[derive(Deserialize)]
struct MarkBody {
    name: String,
}

#[derive(Deserialize, Default)]
struct StopBody {
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    account_sid: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode one raw text frame from the carrier.
///
/// ## Returns:
/// - **Ok(event)**: Any parseable JSON object, including unknown or incomplete events
/// - **Err(MalformedMessage)**: The text is not a JSON object at all
pub fn decode(raw: &str) -> Result<InboundEvent, SessionError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| SessionError::MalformedMessage(e.to_string()))?;

    let Value::Object(envelope) = value else {
        return Err(SessionError::MalformedMessage(
            "expected a JSON object".to_string(),
        ));
    };

    let tag = envelope.get("event").and_then(Value::as_str);
    let stream_sid = string_field(&envelope, "stream_sid");

    let event = match tag {
        Some("connected") => Some(InboundEvent::Connected),
        Some("start") => decode_start(&envelope).map(InboundEvent::Start),
        Some("media") => body::<AudioFrame>(&envelope, "media").map(|frame| InboundEvent::Media {
            stream_sid,
            sequence_number: scalar_field(&envelope, "sequence_number"),
            frame,
        }),
        Some("dtmf") => body::<DtmfBody>(&envelope, "dtmf").map(|dtmf| InboundEvent::Dtmf {
            stream_sid,
            digit: dtmf.digit,
            duration: dtmf.duration,
        }),
        Some("mark") => body::<MarkBody>(&envelope, "mark").map(|mark| InboundEvent::Mark {
            stream_sid,
            name: mark.name,
        }),
        Some("clear") => Some(InboundEvent::Clear { stream_sid }),
        Some("stop") => {
            // Every stop field is optional, a bare `{"event":"stop"}` still ends the call.
            let stop = body::<StopBody>(&envelope, "stop").unwrap_or_default();
            Some(InboundEvent::Stop {
                call_sid: stop.call_sid,
                account_sid: stop.account_sid,
                reason: stop.reason,
            })
        }
        _ => None,
    };

    Ok(event.unwrap_or_else(|| InboundEvent::Unknown {
        event: tag.map(str::to_string),
    }))
}

/// `start` fields may be nested under `start` or flattened into the envelope.
/// Nested values win; `stream_sid` falls back to the envelope.
fn decode_start(envelope: &Map<String, Value>) -> Option<StartInfo> {
    let mut fields = envelope.clone();
    if let Some(Value::Object(nested)) = envelope.get("start") {
        for (key, value) in nested {
            if !value.is_null() {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
    serde_json::from_value(Value::Object(fields)).ok()
}

fn body<T: DeserializeOwned>(envelope: &Map<String, Value>, key: &str) -> Option<T> {
    envelope
        .get(key)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn string_field(envelope: &Map<String, Value>, key: &str) -> Option<String> {
    envelope.get(key).and_then(Value::as_str).map(str::to_string)
}

fn scalar_field(envelope: &Map<String, Value>, key: &str) -> Option<Scalar> {
    envelope
        .get(key)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nested_start() {
        let raw = r#"{
            "event": "start",
            "sequence_number": 1,
            "stream_sid": "test_stream_12345",
            "start": {
                "stream_sid": "test_stream_12345",
                "call_sid": "test_call_67890",
                "account_sid": "test_account_11111",
                "from": "+1234567890",
                "to": "+0987654321",
                "media_format": {"encoding": "raw/slin", "sample_rate": "8000", "bit_rate": "16"}
            }
        }"#;

        match decode(raw).unwrap() {
            InboundEvent::Start(info) => {
                assert_eq!(info.stream_sid, "test_stream_12345");
                assert_eq!(info.call_sid.as_deref(), Some("test_call_67890"));
                assert_eq!(info.from.as_deref(), Some("+1234567890"));
                assert_eq!(info.media_format.unwrap()["sample_rate"], "8000");
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_flat_start() {
        let raw = r#"{"event":"start","stream_sid":"s1","call_sid":"c1","from":"+1","to":"+2"}"#;
        match decode(raw).unwrap() {
            InboundEvent::Start(info) => {
                assert_eq!(info.stream_sid, "s1");
                assert_eq!(info.call_sid.as_deref(), Some("c1"));
                assert_eq!(info.account_sid, None);
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_start_without_stream_sid_is_unknown() {
        let raw = r#"{"event":"start","start":{"call_sid":"c1"}}"#;
        assert_eq!(
            decode(raw).unwrap(),
            InboundEvent::Unknown { event: Some("start".to_string()) }
        );
    }

    #[test]
    fn test_decode_media_keeps_scalar_types() {
        let raw = r#"{"event":"media","sequence_number":2,"stream_sid":"s1",
            "media":{"chunk":1,"timestamp":"100","payload":"dGVzdA=="}}"#;

        match decode(raw).unwrap() {
            InboundEvent::Media { stream_sid, sequence_number, frame } => {
                assert_eq!(stream_sid.as_deref(), Some("s1"));
                assert_eq!(sequence_number, Some(Scalar::from(2u64)));
                assert_eq!(frame.chunk, Some(Scalar::from(1u64)));
                assert_eq!(frame.timestamp, Some(Scalar::from("100")));
                assert_eq!(frame.payload, "dGVzdA==");
                assert_eq!(frame.payload_len(), 8);
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_media_without_payload_is_unknown() {
        let raw = r#"{"event":"media","media":{"chunk":3}}"#;
        assert_eq!(
            decode(raw).unwrap(),
            InboundEvent::Unknown { event: Some("media".to_string()) }
        );

        let raw = r#"{"event":"media"}"#;
        assert_eq!(decode(raw).unwrap().kind(), EventKind::Unknown);
    }

    #[test]
    fn test_decode_dtmf_mark_clear_stop() {
        let dtmf = decode(r#"{"event":"dtmf","dtmf":{"digit":"8","duration":"250"}}"#).unwrap();
        assert_eq!(
            dtmf,
            InboundEvent::Dtmf {
                stream_sid: None,
                digit: "8".to_string(),
                duration: Some(Scalar::from("250")),
            }
        );

        let mark = decode(r#"{"event":"mark","stream_sid":"s1","mark":{"name":"m1"}}"#).unwrap();
        assert_eq!(
            mark,
            InboundEvent::Mark { stream_sid: Some("s1".to_string()), name: "m1".to_string() }
        );

        let clear = decode(r#"{"event":"clear"}"#).unwrap();
        assert_eq!(clear, InboundEvent::Clear { stream_sid: None });

        let stop = decode(r#"{"event":"stop","stop":{"call_sid":"c1","reason":"callended"}}"#).unwrap();
        assert_eq!(
            stop,
            InboundEvent::Stop {
                call_sid: Some("c1".to_string()),
                account_sid: None,
                reason: Some("callended".to_string()),
            }
        );

        let bare_stop = decode(r#"{"event":"stop"}"#).unwrap();
        assert_eq!(bare_stop.kind(), EventKind::Stop);
    }

    #[test]
    fn test_unrecognized_and_missing_tags() {
        assert_eq!(
            decode(r#"{"event":"transcript","text":"hi"}"#).unwrap(),
            InboundEvent::Unknown { event: Some("transcript".to_string()) }
        );
        assert_eq!(
            decode(r#"{"foo":1}"#).unwrap(),
            InboundEvent::Unknown { event: None }
        );
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(matches!(
            decode(r#"{"event":"media","media":{"#),
            Err(SessionError::MalformedMessage(_))
        ));
        assert!(matches!(decode("not json"), Err(SessionError::MalformedMessage(_))));
        assert!(matches!(decode("[1,2,3]"), Err(SessionError::MalformedMessage(_))));
    }
}
