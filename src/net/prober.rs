// Outbound status prober
// Connects to a client, asks for its counter, acks the reply

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::messages::{HeartbeatMessage, StatusMessage};
use crate::codec::{Decoded, MessageCodec};
use crate::constants::ACK_MESSAGE;

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub status_count: u32,
}

impl ProbeOutcome {
    pub const UNREACHABLE: ProbeOutcome = ProbeOutcome {
        reachable: false,
        status_count: 0,
    };

    pub fn reachable(status_count: u32) -> Self {
        ProbeOutcome {
            reachable: true,
            status_count,
        }
    }
}

/// Something that can ask one client for its status. Never fails: every
/// problem collapses to [`ProbeOutcome::UNREACHABLE`].
#[async_trait]
pub trait StatusProber: Send + Sync {
    async fn probe(&self, host: &str, port: u16, request: StatusMessage) -> ProbeOutcome;
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("expected status msg, received nothing")]
    NoReply,
    #[error("protocol: {0}")]
    Protocol(String),
}

/// Probes clients over TCP using the configured codec
pub struct TcpProber {
    codec: Arc<dyn MessageCodec>,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(codec: Arc<dyn MessageCodec>, timeout: Duration) -> Self {
        TcpProber { codec, timeout }
    }

    /// Connect, send the request and read the status reply.
    async fn request_status(
        &self,
        host: &str,
        port: u16,
        request: &StatusMessage,
    ) -> Result<(Connection, StatusMessage), ProbeError> {
        let mut conn = Connection::connect(host, port).await.map_err(ProbeError::Connect)?;
        debug!("Client connected, sending status request {:?}", request);
        conn.write_bytes(&self.codec.encode_status(request)).await?;

        let data = conn.read_frame().await?;
        if data.is_empty() {
            return Err(ProbeError::NoReply);
        }
        debug!(frame = %hex::encode(&data), "status reply received");

        match self.codec.decode_status(&data) {
            Ok(Decoded::Message(status)) => Ok((conn, status)),
            Ok(Decoded::WrongKind { found }) => Err(ProbeError::Protocol(format!(
                "expected status reply, received {} message",
                found
            ))),
            Err(e) => Err(ProbeError::Protocol(e.to_string())),
        }
    }

    /// Best effort: the probe result is already decided.
    async fn send_ack(&self, conn: &mut Connection, host: &str, port: u16, identifier: u32) {
        let ack = HeartbeatMessage::new(ACK_MESSAGE, host, port, identifier);
        let bytes = self.codec.encode_heartbeat(&ack);
        match time::timeout(self.timeout, conn.write_bytes(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("ack to {}:{} failed: {}", host, port, e),
            Err(_) => debug!("ack to {}:{} timed out", host, port),
        }
        let _ = conn.shutdown().await;
    }
}

#[async_trait]
impl StatusProber for TcpProber {
    async fn probe(&self, host: &str, port: u16, request: StatusMessage) -> ProbeOutcome {
        info!("send status request to client host {} port {}", host, port);
        let (mut conn, status) = match time::timeout(self.timeout, self.request_status(host, port, &request)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!("Status request to {}:{} failed: {}", host, port, e);
                return ProbeOutcome::UNREACHABLE;
            }
            Err(_) => {
                warn!("Status request to {}:{} timed out after {:?}", host, port, self.timeout);
                return ProbeOutcome::UNREACHABLE;
            }
        };
        debug!(
            identifier = status.identifier,
            message_count = status.message_count,
            "status reply decoded"
        );
        self.send_ack(&mut conn, host, port, status.identifier).await;
        ProbeOutcome::reachable(status.message_count)
    }
}
