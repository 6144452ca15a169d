// Client records tracked by the registry and persisted by the store

use crate::net::messages::HeartbeatMessage;

/// Identity and liveness facts about one remote client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub identifier: u32,
    pub host: String,
    pub port: u16,
    /// Last counter the client reported in a status reply
    pub status_count: u32,
    pub connected: bool,
    /// Unix seconds of the last write; only set on records read back from the store
    pub last_seen_at: Option<i64>,
}

impl ClientRecord {
    pub fn new(identifier: u32, host: impl Into<String>, port: u16) -> Self {
        ClientRecord {
            identifier,
            host: host.into(),
            port,
            status_count: 0,
            connected: false,
            last_seen_at: None,
        }
    }

    /// Record for a client that just announced itself with a heartbeat
    pub fn from_heartbeat(hb: &HeartbeatMessage) -> Self {
        ClientRecord {
            connected: true,
            ..ClientRecord::new(hb.identifier, hb.client_host.clone(), hb.client_port)
        }
    }

    /// Record for a client that answered a status probe this cycle
    pub fn probed(identifier: u32, host: impl Into<String>, port: u16, status_count: u32) -> Self {
        ClientRecord {
            status_count,
            connected: true,
            ..ClientRecord::new(identifier, host, port)
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
