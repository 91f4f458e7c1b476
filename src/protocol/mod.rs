//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Receive buffering with parser-friendly cursor semantics
//! - Handshake (C0C1C2/S0S1S2 exchange)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and parsing

pub mod buffer;
pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use buffer::ByteBuffer;
pub use chunk::{ChunkDecoder, ChunkEncoder, ChunkStream, MessagePayload};
pub use handshake::Handshake;
pub use message::RtmpMessage;
