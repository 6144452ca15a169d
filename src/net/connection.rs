// TCP connection wrapper
// One request/response exchange per connection, each direction a single raw frame

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::constants::READ_BUFFER_SIZE;

/// A single TCP connection to a client, inbound or outbound
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Connection { stream, peer_addr }
    }

    /// Open an outbound connection
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer_addr = stream.peer_addr()?;
        Ok(Connection::new(stream, peer_addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read whatever the peer sent, up to one buffer. Empty result means the peer closed.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write raw bytes to the connection
    pub async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
