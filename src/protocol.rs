//! Wire format for server-pushed events
//!
//! The node pushes named events as JSON text frames. Two shapes are accepted:
//!
//! ```json
//! {"event": "backupProgress", "data": {"database": 40}}
//! ["backupProgress", {"database": 40}]
//! ```
//!
//! A missing payload decodes as `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::LinkError;

/// Lifecycle event: connection established
pub const EVENT_CONNECT: &str = "connect";
/// Lifecycle event: connection closed (either side)
pub const EVENT_DISCONNECT: &str = "disconnect";
/// Lifecycle event: a connection attempt failed
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

/// Event names only the transport itself may emit
pub const LIFECYCLE_EVENTS: [&str; 3] = [EVENT_CONNECT, EVENT_DISCONNECT, EVENT_CONNECT_ERROR];

pub fn is_lifecycle_event(name: &str) -> bool {
    LIFECYCLE_EVENTS.contains(&name)
}

/// A decoded inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl InboundEvent {
    pub fn new(event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Decode a text frame into an event
pub fn decode_frame(text: &str) -> Result<InboundEvent, LinkError> {
    let value: JsonValue = serde_json::from_str(text)?;

    match value {
        JsonValue::Object(_) => {
            let event: InboundEvent = serde_json::from_value(value)?;
            Ok(event)
        }
        JsonValue::Array(items) => {
            let mut items = items.into_iter();
            let event = match items.next() {
                Some(JsonValue::String(name)) => name,
                Some(other) => {
                    return Err(LinkError::Protocol(format!(
                        "event name must be a string, got {}",
                        other
                    )))
                }
                None => return Err(LinkError::Protocol("empty event frame".into())),
            };
            let data = items.next().unwrap_or(JsonValue::Null);
            Ok(InboundEvent { event, data })
        }
        other => Err(LinkError::Protocol(format!(
            "expected object or array frame, got {}",
            other
        ))),
    }
}

/// Decode a binary frame; only UTF-8 JSON is understood
pub fn decode_binary_frame(data: &[u8]) -> Result<InboundEvent, LinkError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| LinkError::Protocol(format!("binary frame is not UTF-8: {}", e)))?;
    decode_frame(text)
}

/// Encode an event in the object shape
pub fn encode_frame(event: &str, data: &JsonValue) -> String {
    serde_json::json!({ "event": event, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object_frame() {
        let event = decode_frame(r#"{"event":"backupProgress","data":{"database":40}}"#).unwrap();
        assert_eq!(event.event, "backupProgress");
        assert_eq!(event.data, json!({"database": 40}));
    }

    #[test]
    fn test_decode_array_frame() {
        let event = decode_frame(r#"["restoreProgress",{"files":5}]"#).unwrap();
        assert_eq!(event, InboundEvent::new("restoreProgress", json!({"files": 5})));
    }

    #[test]
    fn test_missing_payload_is_null() {
        assert_eq!(decode_frame(r#"{"event":"ping"}"#).unwrap().data, JsonValue::Null);
        assert_eq!(decode_frame(r#"["ping"]"#).unwrap().data, JsonValue::Null);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(decode_frame("42"), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_frame("[]"), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_frame("[1, {}]"), Err(LinkError::Protocol(_))));
        assert!(matches!(decode_frame("{not json"), Err(LinkError::Json(_))));
        assert!(matches!(decode_frame(r#"{"data":{}}"#), Err(LinkError::Json(_))));
    }

    #[test]
    fn test_decode_binary_frame() {
        let event = decode_binary_frame(br#"["backupProgress",{"files":1}]"#).unwrap();
        assert_eq!(event.event, "backupProgress");
        assert!(decode_binary_frame(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_encode_frame_decodes_back() {
        let text = encode_frame("backupProgress", &json!({"database": 100}));
        let event = decode_frame(&text).unwrap();
        assert_eq!(event.data["database"], 100);
    }

    #[test]
    fn test_lifecycle_names() {
        assert!(is_lifecycle_event("connect"));
        assert!(is_lifecycle_event("connect_error"));
        assert!(!is_lifecycle_event("backupProgress"));
    }
}
