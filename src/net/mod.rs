// Network layer module
// Inbound heartbeat listener and outbound status prober over TCP

pub mod connection;
pub mod handler;
pub mod listener;
pub mod messages;
pub mod prober;

pub use connection::Connection;
pub use handler::{HandlerError, HandlerOutcome, HandlerState, HeartbeatHandler};
pub use listener::TcpServer;
pub use messages::{ErrorMessage, HeartbeatMessage, MessageType, StatusMessage};
pub use prober::{ProbeOutcome, StatusProber, TcpProber};
