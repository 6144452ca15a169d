use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::codec::CodecKind;
use crate::constants::{
    DEFAULT_POLL_INTERVAL_LOWER_SECS, DEFAULT_POLL_INTERVAL_UPPER_SECS, DEFAULT_PROBE_TIMEOUT_SECS,
};
use crate::reconciler::PollInterval;

/// Heartbeat registry configuration. Every flag can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// IP address or host name to listen on for client heartbeats.
    #[arg(long, env = "SERVER_IP")]
    pub server_ip: String,

    /// TCP port to listen on for client heartbeats.
    #[arg(long, env = "SERVER_PORT")]
    pub server_port: u16,

    /// SQLite database holding the last known connected clients.
    #[arg(long, env = "DB_PATH", value_name = "FILE", default_value = "clients.db")]
    pub db_path: PathBuf,

    /// Lower bound of the randomized polling interval, in seconds.
    #[arg(long, env = "POLL_INTERVAL_LOWER", default_value_t = DEFAULT_POLL_INTERVAL_LOWER_SECS)]
    pub poll_interval_lower: u64,

    /// Upper bound of the randomized polling interval, in seconds.
    #[arg(long, env = "POLL_INTERVAL_UPPER", default_value_t = DEFAULT_POLL_INTERVAL_UPPER_SECS)]
    pub poll_interval_upper: u64,

    /// Timeout for one status probe (connect and reply), in seconds.
    #[arg(long, env = "PROBE_TIMEOUT", default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    pub probe_timeout: u64,

    /// Wire format spoken with clients.
    #[arg(long, env = "CODEC", value_enum, default_value_t = CodecKind::Binary)]
    pub codec: CodecKind,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {reason}")]
    ListenAddr { addr: String, reason: String },
    #[error("poll interval lower bound {lower}s exceeds upper bound {upper}s")]
    PollInterval { lower: u64, upper: u64 },
    #[error("probe timeout must be at least one second")]
    ProbeTimeout,
}

impl Config {
    /// Resolve `server_ip:server_port` to a bind address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server_ip, self.server_port);
        if self.server_ip.trim().is_empty() {
            return Err(ConfigError::ListenAddr {
                addr,
                reason: "SERVER_IP is empty".to_string(),
            });
        }
        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            return Ok(parsed);
        }
        let resolved = (self.server_ip.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::ListenAddr {
                addr: addr.clone(),
                reason: e.to_string(),
            })?
            .next();
        resolved.ok_or_else(|| ConfigError::ListenAddr {
            addr,
            reason: "host name did not resolve".to_string(),
        })
    }

    pub fn poll_interval(&self) -> Result<PollInterval, ConfigError> {
        PollInterval::new(self.poll_interval_lower, self.poll_interval_upper).ok_or(ConfigError::PollInterval {
            lower: self.poll_interval_lower,
            upper: self.poll_interval_upper,
        })
    }

    pub fn probe_timeout(&self) -> Result<Duration, ConfigError> {
        if self.probe_timeout == 0 {
            return Err(ConfigError::ProbeTimeout);
        }
        Ok(Duration::from_secs(self.probe_timeout))
    }
}
