//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::*;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Outbound chunk size announced after connect
    pub out_chunk_size: u32,

    /// Window acknowledgement size announced at connect
    pub window_ack_size: u32,

    /// Peer bandwidth advertised at connect
    pub peer_bandwidth: u32,

    /// Handshake must complete within this deadline
    pub handshake_timeout: Duration,

    /// Disconnect if no data is read for this long
    pub idle_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Application-level write buffer size
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1935".parse().unwrap(),
            max_connections: 0, // unlimited
            out_chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            tcp_nodelay: true, // matters for live latency
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a config listening on the given address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }

    /// Set the listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the outbound chunk size
    pub fn out_chunk_size(mut self, size: u32) -> Self {
        self.out_chunk_size = size.min(MAX_CHUNK_SIZE);
        self
    }

    /// Set the window acknowledgement size
    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    /// Set the handshake deadline
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle-read deadline
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}
