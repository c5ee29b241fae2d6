use serde_json::{Map, Value};

use crate::constants::CONTROL_MESSAGE_TYPES;

pub type JsonObject = Map<String, Value>;

/// Consumer of decoded telemetry messages
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: JsonObject);
}

impl<F> MessageHandler for F
where
    F: Fn(JsonObject) + Send + Sync + 'static,
{
    fn on_message(&self, message: JsonObject) {
        self(message)
    }
}

#[derive(Debug)]
pub enum Decoded {
    Telemetry(JsonObject),
    /// Protocol chatter carrying a recognized control `type`
    Control(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is JSON but not an object")]
    NotAnObject,
}

/// Parse an inbound payload as a JSON object envelope
pub fn decode(payload: &[u8]) -> Result<Decoded, EnvelopeError> {
    let Value::Object(object) = serde_json::from_slice::<Value>(payload)? else {
        return Err(EnvelopeError::NotAnObject);
    };

    match object.get("type").and_then(Value::as_str) {
        Some(kind) if CONTROL_MESSAGE_TYPES.contains(&kind) => Ok(Decoded::Control(kind.to_string())),
        _ => Ok(Decoded::Telemetry(object)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_telemetry() {
        let decoded = decode(br#"{"tag":"boiler.pressure","value":4.2}"#).unwrap();
        match decoded {
            Decoded::Telemetry(object) => {
                assert_eq!(object.get("value"), Some(&json!(4.2)));
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_message() {
        let decoded = decode(br#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(decoded, Decoded::Control(kind) if kind == "heartbeat"));
    }

    #[test]
    fn test_unrecognized_type_is_telemetry() {
        let decoded = decode(br#"{"type":"reading","value":1}"#).unwrap();
        assert!(matches!(decoded, Decoded::Telemetry(_)));
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(decode(b"not json"), Err(EnvelopeError::Json(_))));
        assert!(matches!(decode(b"[1,2]"), Err(EnvelopeError::NotAnObject)));
        assert!(matches!(decode(b""), Err(EnvelopeError::Json(_))));
    }
}
