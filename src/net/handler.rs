// Inbound heartbeat handler
// Reads one heartbeat, registers the client, replies with an ack and closes

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::client::ClientRecord;
use crate::codec::{Decoded, MessageCodec};
use crate::constants::{HEARTBEAT_READ_TIMEOUT_SECS, REPLY_WRITE_TIMEOUT_SECS, WRONG_DECODER_REASON};
use crate::registry::Registry;

/// State of one inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the client's single heartbeat frame
    AwaitingHeartbeat,
    /// Frame processed, reply being written
    Replying,
    /// Connection finished
    Closed,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Peer closed the connection before sending anything
    #[error("socket closed before a heartbeat was received")]
    PeerClosed,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("no heartbeat received within {0:?}")]
    ReadTimeout(Duration),
    #[error("reply write timed out")]
    WriteTimeout,
}

/// What the handler did with the frame it received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Heartbeat accepted; `new` is true if the identifier was not yet in the registry
    Registered { identifier: u32, new: bool },
    /// Frame was not a usable heartbeat; an error reply was sent
    Ignored { reason: String },
}

pub struct HeartbeatHandler {
    connection: Connection,
    state: HandlerState,
    registry: Arc<Registry>,
    codec: Arc<dyn MessageCodec>,
    read_timeout: Duration,
}

impl HeartbeatHandler {
    pub fn new(connection: Connection, registry: Arc<Registry>, codec: Arc<dyn MessageCodec>) -> Self {
        HeartbeatHandler {
            connection,
            state: HandlerState::AwaitingHeartbeat,
            registry,
            codec,
            read_timeout: Duration::from_secs(HEARTBEAT_READ_TIMEOUT_SECS),
        }
    }

    /// Override how long to wait for the heartbeat frame.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Drive the connection to completion. The connection is closed on every path.
    pub async fn run(&mut self) -> Result<HandlerOutcome, HandlerError> {
        let result = self.exchange().await;
        self.state = HandlerState::Closed;
        result
    }

    async fn exchange(&mut self) -> Result<HandlerOutcome, HandlerError> {
        let peer = self.connection.peer_addr();
        let data = match time::timeout(self.read_timeout, self.connection.read_frame()).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(HandlerError::ReadTimeout(self.read_timeout)),
        };
        if data.is_empty() {
            return Err(HandlerError::PeerClosed);
        }
        debug!(%peer, frame = %hex::encode(&data), "heartbeat frame received");
        self.state = HandlerState::Replying;

        let (reply, outcome) = match self.codec.decode_heartbeat(&data) {
            Ok(Decoded::Message(hb)) => {
                info!(
                    "Client info: host {} port {} identifier {}",
                    hb.client_host, hb.client_port, hb.identifier
                );
                let new = self.registry.upsert(ClientRecord::from_heartbeat(&hb)).await;
                let outcome = HandlerOutcome::Registered {
                    identifier: hb.identifier,
                    new,
                };
                (self.codec.encode_heartbeat(&hb.ack()), outcome)
            }
            Ok(Decoded::WrongKind { found }) => {
                warn!("Expected heartbeat from {}, received {} message", peer, found);
                let outcome = HandlerOutcome::Ignored {
                    reason: format!("unexpected {} message", found),
                };
                (self.codec.encode_error(WRONG_DECODER_REASON), outcome)
            }
            Err(e) => {
                warn!("Malformed heartbeat from {}: {}", peer, e);
                let reason = e.to_string();
                (self.codec.encode_error(&reason), HandlerOutcome::Ignored { reason })
            }
        };

        match time::timeout(
            Duration::from_secs(REPLY_WRITE_TIMEOUT_SECS),
            self.connection.write_bytes(&reply),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(HandlerError::WriteTimeout),
        }
        if let Err(e) = self.connection.shutdown().await {
            debug!(%peer, "shutdown after reply failed: {}", e);
        }
        Ok(outcome)
    }
}
