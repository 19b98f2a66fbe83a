//! Outbound frames: media echoes and acknowledgements.
//!
//! Each shape mirrors the inbound event it answers. Encoding builds a `serde_json::Value`
//! and renders it with `Display`, so it never fails.

use super::inbound::{AudioFrame, Scalar};
use serde_json::{json, Map, Value};

/// A frame we send back to the carrier.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Replay of one buffered caller frame.
    MediaEcho {
        stream_sid: Option<String>,
        frame: AudioFrame,
    },
    DtmfAck {
        stream_sid: Option<String>,
        digit: String,
        duration: Option<Scalar>,
    },
    MarkAck {
        stream_sid: Option<String>,
        name: String,
    },
    ClearAck {
        stream_sid: Option<String>,
    },
}

impl OutboundFrame {
    /// Monitor/log label for this frame.
    pub fn label(&self) -> &'static str {
        match self {
            OutboundFrame::MediaEcho { .. } => "media_echo",
            OutboundFrame::DtmfAck { .. } => "dtmf_ack",
            OutboundFrame::MarkAck { .. } => "mark_ack",
            OutboundFrame::ClearAck { .. } => "clear_ack",
        }
    }

    fn to_value(&self) -> Value {
        match self {
            OutboundFrame::MediaEcho { stream_sid, frame } => {
                let mut media = frame.extra.clone();
                if let Some(chunk) = &frame.chunk {
                    media.insert("chunk".to_string(), scalar_value(chunk));
                }
                if let Some(timestamp) = &frame.timestamp {
                    media.insert("timestamp".to_string(), scalar_value(timestamp));
                }
                media.insert("payload".to_string(), Value::String(frame.payload.clone()));
                json!({
                    "event": "media",
                    "stream_sid": stream_sid,
                    "media": media,
                })
            }
            OutboundFrame::DtmfAck { stream_sid, digit, duration } => {
                let mut dtmf = Map::new();
                dtmf.insert("digit".to_string(), Value::String(digit.clone()));
                if let Some(duration) = duration {
                    dtmf.insert("duration".to_string(), scalar_value(duration));
                }
                json!({
                    "event": "dtmf",
                    "stream_sid": stream_sid,
                    "dtmf": dtmf,
                })
            }
            OutboundFrame::MarkAck { stream_sid, name } => json!({
                "event": "mark",
                "stream_sid": stream_sid,
                "mark": { "name": name },
            }),
            OutboundFrame::ClearAck { stream_sid } => json!({
                "event": "clear",
                "stream_sid": stream_sid,
            }),
        }
    }
}

fn scalar_value(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Number(n) => Value::Number(n.clone()),
        Scalar::Text(s) => Value::String(s.clone()),
    }
}

/// Render a frame as the text payload of a WebSocket message.
pub fn encode(frame: &OutboundFrame) -> String {
    frame.to_value().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_media_echo_preserves_fields_verbatim() {
        let frame = AudioFrame {
            chunk: Some(Scalar::from(7u64)),
            timestamp: Some(Scalar::from("700")),
            payload: "AAEC".to_string(),
            extra: Map::new(),
        };
        let text = encode(&OutboundFrame::MediaEcho {
            stream_sid: Some("s1".to_string()),
            frame,
        });

        let value = parse(&text);
        assert_eq!(value["event"], "media");
        assert_eq!(value["stream_sid"], "s1");
        assert_eq!(value["media"]["chunk"], 7);
        assert_eq!(value["media"]["timestamp"], "700");
        assert_eq!(value["media"]["payload"], "AAEC");
    }

    #[test]
    fn test_media_echo_omits_absent_fields() {
        let frame = AudioFrame { chunk: None, timestamp: None, payload: "x".to_string(), extra: Map::new() };
        let value = parse(&encode(&OutboundFrame::MediaEcho { stream_sid: None, frame }));

        assert!(value["stream_sid"].is_null());
        let media = value["media"].as_object().unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media["payload"], "x");
    }

    #[test]
    fn test_media_echo_keeps_carrier_extras() {
        let raw = r#"{"event":"media","media":{"chunk":"3","payload":"AAEC","track":"inbound","codec":{"name":"slin"}}}"#;
        let frame = match crate::protocol::decode(raw).unwrap() {
            crate::protocol::InboundEvent::Media { frame, .. } => frame,
            other => panic!("expected media, got {:?}", other),
        };
        assert_eq!(frame.extra.len(), 2);

        let value = parse(&encode(&OutboundFrame::MediaEcho { stream_sid: Some("s1".to_string()), frame }));
        assert_eq!(
            value["media"],
            json!({"chunk": "3", "payload": "AAEC", "track": "inbound", "codec": {"name": "slin"}})
        );
    }

    #[test]
    fn test_acknowledgement_shapes() {
        let dtmf = parse(&encode(&OutboundFrame::DtmfAck {
            stream_sid: Some("s1".to_string()),
            digit: "5".to_string(),
            duration: Some(Scalar::from("100")),
        }));
        assert_eq!(dtmf, json!({"event": "dtmf", "stream_sid": "s1", "dtmf": {"digit": "5", "duration": "100"}}));

        let mark = parse(&encode(&OutboundFrame::MarkAck {
            stream_sid: Some("s1".to_string()),
            name: "greeting_done".to_string(),
        }));
        assert_eq!(mark, json!({"event": "mark", "stream_sid": "s1", "mark": {"name": "greeting_done"}}));

        let clear = parse(&encode(&OutboundFrame::ClearAck { stream_sid: None }));
        assert_eq!(clear, json!({"event": "clear", "stream_sid": null}));
    }
}
