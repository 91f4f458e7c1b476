//! RTMP handshake, server side
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |                                        |
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |                                        |
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |                                        |
//!   |          [Handshake Complete]          |
//! ```
//!
//! Only the simple handshake is implemented (no HMAC digest). C0 must carry
//! version 3; S2 echoes the client's C1 verbatim; C2 content is accepted
//! without validation for encoder compatibility.
//!
//! Reference: RTMP Specification Section 5.2

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::buffer::ByteBuffer;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Server handshake state machine
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for the client's C0 + C1
    AwaitC0C1,
    /// S0S1S2 sent, waiting for the client's C2
    AwaitC2,
    /// Handshake complete
    Done,
}

impl Handshake {
    /// Create a handshake in its initial state
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitC0C1,
        }
    }

    /// Check if the handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Consume C0 + C1 and produce S0 + S1 + S2
    ///
    /// Returns `Ok(None)` until the full 1537 bytes are buffered; consumes
    /// nothing in that case. On success the returned bytes are the complete
    /// server response and the state advances to awaiting C2.
    pub fn handle_c0c1(&mut self, buf: &mut ByteBuffer) -> Result<Option<Bytes>> {
        if self.state != HandshakeState::AwaitC0C1 {
            return Err(HandshakeError::InvalidState.into());
        }

        if !buf.require(1 + HANDSHAKE_SIZE) {
            return Ok(None);
        }

        let c0c1 = buf.consume(1 + HANDSHAKE_SIZE);

        let version = c0c1[0];
        if version != RTMP_VERSION {
            return Err(HandshakeError::InvalidVersion(version).into());
        }

        let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);

        // S0
        response.put_u8(RTMP_VERSION);

        // S1: time + zero + random
        response.put_slice(&generate_packet());

        // S2: verbatim echo of C1
        response.put_slice(&c0c1[1..]);

        self.state = HandshakeState::AwaitC2;
        Ok(Some(response.freeze()))
    }

    /// Consume the client's C2
    ///
    /// Returns `Ok(false)` until the full 1536 bytes are buffered. The
    /// content is not validated; several encoders echo creatively.
    pub fn handle_c2(&mut self, buf: &mut ByteBuffer) -> Result<bool> {
        if self.state != HandshakeState::AwaitC2 {
            return Err(HandshakeError::InvalidState.into());
        }

        if !buf.require(HANDSHAKE_SIZE) {
            return Ok(false);
        }

        buf.consume(HANDSHAKE_SIZE);
        self.state = HandshakeState::Done;
        Ok(true)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate the S1 packet
///
/// Format (1536 bytes):
/// - Bytes 0-3: Timestamp (32-bit, big-endian)
/// - Bytes 4-7: Zero (simple handshake)
/// - Bytes 8-1535: Random filler
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());
    packet[4..8].copy_from_slice(&[0, 0, 0, 0]);

    // The random field only needs to be non-repeating, not secure; a
    // timestamp-seeded LCG avoids pulling in an RNG dependency.
    let mut seed = timestamp as u64 | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_server_handshake() {
        let mut handshake = Handshake::new();
        let mut buf = ByteBuffer::new();

        // C0 + C1 of zeros (version byte 3)
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = RTMP_VERSION;
        buf.append(&c0c1);

        let response = handshake.handle_c0c1(&mut buf).unwrap().unwrap();
        assert_eq!(response.len(), 1 + HANDSHAKE_SIZE * 2);
        assert_eq!(response[0], RTMP_VERSION);

        // S2 is a verbatim echo of C1
        assert_eq!(&response[1 + HANDSHAKE_SIZE..], &c0c1[1..]);
        assert!(!handshake.is_done());

        // C2
        buf.append(&[0u8; HANDSHAKE_SIZE]);
        assert!(handshake.handle_c2(&mut buf).unwrap());
        assert!(handshake.is_done());
    }

    #[test]
    fn test_partial_c0c1_consumes_nothing() {
        let mut handshake = Handshake::new();
        let mut buf = ByteBuffer::new();

        buf.append(&[RTMP_VERSION]);
        buf.append(&[0u8; 100]);

        assert!(handshake.handle_c0c1(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 101);

        // Delivering the rest completes the exchange.
        buf.append(&[0u8; HANDSHAKE_SIZE - 100]);
        assert!(handshake.handle_c0c1(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut handshake = Handshake::new();
        let mut buf = ByteBuffer::new();

        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 6; // RTMPE, unsupported
        buf.append(&c0c1);

        assert!(handshake.handle_c0c1(&mut buf).is_err());
    }

    #[test]
    fn test_c2_before_c0c1_is_state_error() {
        let mut handshake = Handshake::new();
        let mut buf = ByteBuffer::new();
        buf.append(&[0u8; HANDSHAKE_SIZE]);

        assert!(handshake.handle_c2(&mut buf).is_err());
    }

    #[test]
    fn test_s1_layout() {
        let packet = generate_packet();

        // Bytes 4-7 are zero in the simple handshake
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);

        // Random filler is not all zeros
        assert!(packet[8..].iter().any(|&b| b != 0));
    }
}
