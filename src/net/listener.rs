// TCP listener and server
// Accepts inbound client connections and hands each to a HeartbeatHandler

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::handler::{HandlerError, HandlerOutcome, HeartbeatHandler};
use crate::codec::MessageCodec;
use crate::registry::Registry;

/// TCP server that accepts heartbeat connections
pub struct TcpServer {
    addr: SocketAddr,
    active: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    /// Bind `addr` and spawn the accept loop. Each connection runs in its own task;
    /// a failing connection is logged and never reaches the accept loop.
    pub async fn start(
        addr: SocketAddr,
        registry: Arc<Registry>,
        codec: Arc<dyn MessageCodec>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let active = Arc::new(AtomicUsize::new(0));
        let accept_active = Arc::clone(&active);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let registry = Arc::clone(&registry);
                                let codec = Arc::clone(&codec);
                                let active = Arc::clone(&accept_active);
                                active.fetch_add(1, Ordering::SeqCst);
                                info!("client connected from {}", peer_addr);
                                tokio::spawn(async move {
                                    let connection = Connection::new(stream, peer_addr);
                                    let mut handler = HeartbeatHandler::new(connection, registry, codec);
                                    log_outcome(peer_addr, handler.run().await);
                                    active.fetch_sub(1, Ordering::SeqCst);
                                    info!("client disconnected from {}", peer_addr);
                                });
                            }
                            Err(e) => error!("Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("TCP server shutting down");
                        break;
                    }
                }
            }
        });

        info!("Heartbeat listener on {} (TCP)", local_addr);

        Ok(TcpServer {
            addr: local_addr,
            active,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections. In-flight handlers run to completion.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

fn log_outcome(peer: SocketAddr, result: Result<HandlerOutcome, HandlerError>) {
    match result {
        Ok(HandlerOutcome::Registered { identifier, new }) => {
            debug!(%peer, identifier, new, "heartbeat handled");
        }
        Ok(HandlerOutcome::Ignored { reason }) => {
            warn!("Ignored frame from {}: {}", peer, reason);
        }
        Err(HandlerError::PeerClosed) => {
            error!("Client {} closed the socket before sending a heartbeat", peer);
        }
        Err(HandlerError::ReadTimeout(after)) => {
            warn!("Client {} sent no heartbeat within {:?}, closing", peer, after);
        }
        Err(e) => error!("Client error from {}: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryCodec;
    use crate::net::messages::HeartbeatMessage;
    use std::time::Duration;

    async fn start_server(registry: Arc<Registry>) -> TcpServer {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        TcpServer::start(addr, registry, Arc::new(BinaryCodec)).await.unwrap()
    }

    async fn heartbeat(port: u16, hb: &HeartbeatMessage) -> HeartbeatMessage {
        let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
        conn.write_bytes(&BinaryCodec.encode_heartbeat(hb)).await.unwrap();
        let reply = conn.read_frame().await.unwrap();
        BinaryCodec.decode_heartbeat(&reply).unwrap().into_message().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_server_start() {
        let server = start_server(Arc::new(Registry::new())).await;
        assert!(server.addr().port() > 0);
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_server_registers_clients() {
        let registry = Arc::new(Registry::new());
        let server = start_server(registry.clone()).await;
        let port = server.addr().port();

        let ack = heartbeat(port, &HeartbeatMessage::new("hello", "10.0.0.5", 9000, 42)).await;
        assert_eq!(ack, HeartbeatMessage::new("ack", "10.0.0.5", 9000, 42));
        let ack = heartbeat(port, &HeartbeatMessage::new("hello", "10.0.0.6", 9001, 43)).await;
        assert_eq!(ack.identifier, 43);

        assert!(registry.get(42).await.is_some());
        assert!(registry.get(43).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_stop_listener() {
        let registry = Arc::new(Registry::new());
        let server = start_server(registry.clone()).await;
        let port = server.addr().port();

        // Connect and hang up without sending anything
        drop(Connection::connect("127.0.0.1", port).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ack = heartbeat(port, &HeartbeatMessage::new("hello", "h", 1, 7)).await;
        assert_eq!(ack.identifier, 7);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let mut server = start_server(Arc::new(Registry::new())).await;
        let addr = server.addr();
        server.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refused = tokio::time::timeout(
            Duration::from_millis(500),
            Connection::connect("127.0.0.1", addr.port()),
        )
        .await;
        // Either refused outright or accepted by the OS backlog but never served
        if let Ok(Ok(mut conn)) = refused {
            let _ = conn.write_bytes(b"x").await;
            let r = tokio::time::timeout(Duration::from_millis(200), conn.read_frame()).await;
            assert!(!matches!(r, Ok(Ok(ref v)) if !v.is_empty()));
        }
    }
}
