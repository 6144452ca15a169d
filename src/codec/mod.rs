// Wire codecs for heartbeat / status / error messages
// Callers hold an Arc<dyn MessageCodec> and never depend on a concrete format

pub mod binary;
pub mod json;

use std::sync::Arc;

use thiserror::Error;

use crate::net::messages::{ErrorMessage, HeartbeatMessage, MessageType, StatusMessage};

pub use binary::BinaryCodec;
pub use json::JsonCodec;

/// Result of decoding a frame as a particular message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// Frame carried the requested kind.
    Message(T),
    /// Frame is well formed but carries a different kind.
    WrongKind { found: MessageType },
}

impl<T> Decoded<T> {
    pub fn into_message(self) -> Option<T> {
        match self {
            Decoded::Message(m) => Some(m),
            Decoded::WrongKind { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode/decode capability for the three message kinds.
///
/// Encoding never fails: a record that cannot be represented is encoded as an
/// error payload instead, so the peer always receives a decodable frame.
pub trait MessageCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode_heartbeat(&self, msg: &HeartbeatMessage) -> Vec<u8>;
    fn decode_heartbeat(&self, data: &[u8]) -> Result<Decoded<HeartbeatMessage>, CodecError>;

    fn encode_status(&self, msg: &StatusMessage) -> Vec<u8>;
    fn decode_status(&self, data: &[u8]) -> Result<Decoded<StatusMessage>, CodecError>;

    fn encode_error(&self, reason: &str) -> Vec<u8>;
    fn decode_error(&self, data: &[u8]) -> Result<Decoded<ErrorMessage>, CodecError>;
}

/// Codec selection for the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CodecKind {
    Binary,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn MessageCodec> {
        match self {
            CodecKind::Binary => Arc::new(BinaryCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}

/// Required-field checks shared by every codec. Host length is bounded by the
/// binary frame's one-byte length prefix.
pub(crate) fn validate_heartbeat(msg: &HeartbeatMessage) -> Result<(), String> {
    if msg.client_host.trim().is_empty() {
        return Err("heartbeat client_host is required".to_string());
    }
    if msg.client_host.len() > u8::MAX as usize {
        return Err(format!(
            "heartbeat client_host is {} bytes, limit is {}",
            msg.client_host.len(),
            u8::MAX
        ));
    }
    if msg.msg.len() > u16::MAX as usize {
        return Err(format!("heartbeat msg is {} bytes, limit is {}", msg.msg.len(), u16::MAX));
    }
    Ok(())
}
