// JSON codec
// One JSON object per message, discriminated by its "type" field

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use super::{validate_heartbeat, CodecError, Decoded, MessageCodec};
use crate::net::messages::{ErrorMessage, HeartbeatMessage, MessageType, StatusMessage};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Vec<u8> {
        match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("json encode failed: {}", e);
                self.encode_error(&e.to_string())
            }
        }
    }

    fn decode_as<T: DeserializeOwned>(&self, data: &[u8], wanted: MessageType) -> Result<Decoded<T>, CodecError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let type_str = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CodecError::UnknownType(value.get("type").map(|v| v.to_string()).unwrap_or_default()))?;
        let found = MessageType::parse(type_str).ok_or_else(|| CodecError::UnknownType(type_str.to_string()))?;
        if found != wanted {
            return Ok(Decoded::WrongKind { found });
        }
        Ok(Decoded::Message(serde_json::from_value(value)?))
    }
}

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_heartbeat(&self, msg: &HeartbeatMessage) -> Vec<u8> {
        if let Err(reason) = validate_heartbeat(msg) {
            error!("encode_heartbeat failed: {}", reason);
            return self.encode_error(&reason);
        }
        self.to_bytes(msg)
    }

    fn decode_heartbeat(&self, data: &[u8]) -> Result<Decoded<HeartbeatMessage>, CodecError> {
        self.decode_as(data, MessageType::Heartbeat)
    }

    fn encode_status(&self, msg: &StatusMessage) -> Vec<u8> {
        self.to_bytes(msg)
    }

    fn decode_status(&self, data: &[u8]) -> Result<Decoded<StatusMessage>, CodecError> {
        self.decode_as(data, MessageType::Status)
    }

    fn encode_error(&self, reason: &str) -> Vec<u8> {
        // ErrorMessage is two plain strings; serialization cannot fail.
        serde_json::to_vec(&ErrorMessage::new(reason)).unwrap_or_default()
    }

    fn decode_error(&self, data: &[u8]) -> Result<Decoded<ErrorMessage>, CodecError> {
        self.decode_as(data, MessageType::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_heartbeat_from_client_json() {
        let json = br#"{
            "type": "heartbeat",
            "msg": "First Message",
            "client_host": "localhost",
            "client_port": 1000,
            "identifier": 4567
        }"#;
        let decoded = JsonCodec.decode_heartbeat(json).unwrap().into_message().unwrap();
        assert_eq!(decoded, HeartbeatMessage::new("First Message", "localhost", 1000, 4567));
    }

    #[test]
    fn test_status_encoding() {
        let bytes = JsonCodec.encode_status(&StatusMessage::request(1234, 100));
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["identifier"], 1234);
        assert_eq!(value["message_count"], 100);
    }

    #[test]
    fn test_missing_field_is_json_error() {
        let json = br#"{"type": "status", "identifier": 1}"#;
        assert!(matches!(JsonCodec.decode_status(json), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_unknown_type() {
        let json = br#"{"type": "hello", "identifier": 1}"#;
        match JsonCodec.decode_status(json) {
            Err(CodecError::UnknownType(t)) => assert_eq!(t, "hello"),
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_type() {
        let json = br#"{"identifier": 1}"#;
        assert!(matches!(JsonCodec.decode_heartbeat(json), Err(CodecError::UnknownType(_))));
    }

    #[test]
    fn test_garbage_is_json_error() {
        assert!(matches!(JsonCodec.decode_heartbeat(b"\x01\x02"), Err(CodecError::Json(_))));
    }
}
