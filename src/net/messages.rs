// Message records exchanged with clients
// Heartbeat (client -> server announce), status (server -> client poll) and error fallback

use serde::{Deserialize, Serialize};

use crate::constants::ACK_MESSAGE;

/// Discriminant carried by every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Heartbeat,
    Status,
    Error,
}

impl MessageType {
    /// Tag byte used by the binary codec
    pub fn wire_tag(self) -> u8 {
        match self {
            MessageType::Heartbeat => 1,
            MessageType::Status => 2,
            MessageType::Error => 0xFF,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageType::Heartbeat),
            2 => Some(MessageType::Status),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heartbeat" => Some(MessageType::Heartbeat),
            "status" => Some(MessageType::Status),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Announcement sent by a client, and the acknowledgement the server sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub msg: String,
    pub client_host: String,
    pub client_port: u16,
    pub identifier: u32,
}

impl HeartbeatMessage {
    pub fn new(msg: impl Into<String>, client_host: impl Into<String>, client_port: u16, identifier: u32) -> Self {
        HeartbeatMessage {
            msg_type: MessageType::Heartbeat,
            msg: msg.into(),
            client_host: client_host.into(),
            client_port,
            identifier,
        }
    }

    /// Acknowledgement for this heartbeat: same address and identity, type and body fixed.
    pub fn ack(&self) -> Self {
        HeartbeatMessage {
            msg_type: MessageType::Heartbeat,
            msg: ACK_MESSAGE.to_string(),
            client_host: self.client_host.clone(),
            client_port: self.client_port,
            identifier: self.identifier,
        }
    }
}

/// Status poll sent to a client; the client answers with the same shape carrying its counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub identifier: u32,
    pub message_count: u32,
}

impl StatusMessage {
    /// Status request seeded with the counter we last knew for this client
    pub fn request(identifier: u32, message_count: u32) -> Self {
        StatusMessage {
            msg_type: MessageType::Status,
            identifier,
            message_count,
        }
    }
}

/// Fallback payload produced when a message cannot be encoded or was sent to the wrong decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorMessage {
            msg_type: MessageType::Error,
            error: error.into(),
        }
    }
}
