//! Session state machine
//!
//! Tracks one connection from handshake to teardown: the protocol phase,
//! the negotiated chunk sizes, the acknowledgement counters, and which side
//! of the relay (publisher or subscriber) the session ended up on.

use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_ACK_SIZE};

/// Protocol phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the client's C0 + C1
    AwaitC0C1,
    /// S0S1S2 sent, waiting for C2
    AwaitC2,
    /// Handshake complete, chunk parsing active
    Connected,
    /// Torn down
    Closed,
}

/// Role the session plays against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Not yet attached to a stream
    None,
    /// Feeding packets into the registry
    Publisher,
    /// Receiving packets from the registry
    Subscriber,
}

/// Complete per-session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Application name (from connect)
    pub app: String,

    /// Chunk size the peer uses towards us
    pub in_chunk_size: u32,

    /// Chunk size we use towards the peer
    pub out_chunk_size: u32,

    /// Bytes the peer may send before we must acknowledge
    pub window_ack_size: u32,

    /// Total bytes received on this connection
    pub bytes_received: u64,

    /// `bytes_received` value carried by the last Acknowledgement we sent
    pub last_ack: u64,

    /// Registry role
    pub role: SessionRole,

    /// Stream key the session is attached to ("app/name")
    pub stream_key: Option<String>,

    /// Next message stream ID handed out by createStream
    next_stream_id: u32,
}

impl SessionState {
    /// Create state for a freshly accepted connection
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::AwaitC0C1,
            connected_at: Instant::now(),
            app: String::new(),
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bytes_received: 0,
            last_ack: 0,
            role: SessionRole::None,
            stream_key: None,
            next_stream_id: 1, // stream 0 is the NetConnection itself
        }
    }

    /// Record received bytes; returns true when an Acknowledgement is due
    pub fn add_bytes_received(&mut self, n: u64) -> bool {
        self.bytes_received += n;
        self.ack_due()
    }

    /// Whether the unacknowledged span has reached the window
    pub fn ack_due(&self) -> bool {
        self.window_ack_size > 0
            && self.bytes_received - self.last_ack >= self.window_ack_size as u64
    }

    /// Record that an Acknowledgement carrying `bytes_received` went out
    pub fn mark_ack_sent(&mut self) {
        self.last_ack = self.bytes_received;
    }

    /// Allocate the next message stream ID (monotonic, starting at 1)
    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Attach as publisher of `key`
    pub fn start_publishing(&mut self, key: String) {
        self.role = SessionRole::Publisher;
        self.stream_key = Some(key);
    }

    /// Attach as subscriber of `key`
    pub fn start_playing(&mut self, key: String) {
        self.role = SessionRole::Subscriber;
        self.stream_key = Some(key);
    }

    /// Detach from the registry role
    pub fn detach(&mut self) {
        self.role = SessionRole::None;
        self.stream_key = None;
    }
}
