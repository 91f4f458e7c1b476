//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a
//! basic header naming the chunk stream (csid), a message header whose size
//! depends on the 2-bit fmt field, and up to one chunk-size worth of payload.
//!
//! ```text
//! Chunk Format:
//! +-------------+-----------------+-------------------+
//! | Basic Header| Message Header  | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)        |
//! +-------------+-----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! A 24-bit timestamp field of 0xFFFFFF means the real value follows as a
//! 4-byte extended timestamp. When the previous header on a csid used the
//! extended form, fmt=3 chunks on that csid also carry the 4 extra bytes
//! before their payload.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::buffer::ByteBuffer;
use crate::protocol::constants::*;

/// A complete RTMP message reassembled from chunks
#[derive(Debug, Clone)]
pub struct MessagePayload {
    /// Chunk stream ID the message arrived on
    pub csid: u32,
    /// Absolute message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub message_stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

/// Outcome of a header read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProgress {
    /// The buffer does not hold the full header yet; nothing was consumed
    NeedMore,
    /// Header fields are populated per the fmt inheritance rules
    Done,
}

/// Outcome of a payload read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadProgress {
    /// The buffer does not hold the planned read yet; nothing was consumed
    NeedMore,
    /// The message payload is complete
    Complete,
    /// A chunk boundary was reached; the next chunk starts with a basic header
    ChunkBoundary,
}

/// Per-csid assembler state
///
/// Holds the last-seen header fields so fmt > 0 headers can inherit from
/// them, plus the payload accumulator of the in-progress message.
#[derive(Debug, Default)]
pub struct ChunkStream {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    type_id: u8,
    message_stream_id: u32,
    /// Whether the last header on this csid used the extended timestamp form
    extended_timestamp: bool,
    /// Header of the current chunk already parsed (payload still pending)
    header_done: bool,
    payload: BytesMut,
}

impl ChunkStream {
    /// Consume the message header for a chunk with the given fmt
    ///
    /// Consumes exactly the header bytes (plus the 4-byte extended timestamp
    /// when present) or nothing at all. Re-entrant: once the header of the
    /// current chunk has been read, further calls are no-ops until the
    /// payload portion completes.
    pub fn read_header(&mut self, fmt: u8, buf: &mut ByteBuffer) -> Result<HeaderProgress> {
        if self.header_done {
            return Ok(HeaderProgress::Done);
        }

        let header_len = match fmt {
            CHUNK_FMT_0 => 11,
            CHUNK_FMT_1 => 7,
            CHUNK_FMT_2 => 3,
            CHUNK_FMT_3 => 0,
            _ => return Err(ProtocolError::InvalidChunkHeader.into()),
        };

        if !buf.require(header_len) {
            return Ok(HeaderProgress::NeedMore);
        }

        // Decide whether the extended timestamp field follows before
        // consuming anything.
        let extended = if fmt == CHUNK_FMT_3 {
            self.extended_timestamp
        } else {
            let b = buf.peek();
            read_u24(&b[0..3]) >= EXTENDED_TIMESTAMP_THRESHOLD
        };

        let total = header_len + if extended { 4 } else { 0 };
        if !buf.require(total) {
            return Ok(HeaderProgress::NeedMore);
        }

        let mut header = buf.consume(total);

        match fmt {
            CHUNK_FMT_0 => {
                let ts_field = header.get_uint(3) as u32;
                self.message_length = header.get_uint(3) as u32;
                self.type_id = header.get_u8();
                self.message_stream_id = header.get_u32_le();
                let ts = if extended { header.get_u32() } else { ts_field };
                self.timestamp = ts;
                self.timestamp_delta = ts;
            }
            CHUNK_FMT_1 => {
                let delta_field = header.get_uint(3) as u32;
                self.message_length = header.get_uint(3) as u32;
                self.type_id = header.get_u8();
                let delta = if extended { header.get_u32() } else { delta_field };
                self.timestamp_delta = delta;
                self.timestamp = self.timestamp.wrapping_add(delta);
            }
            CHUNK_FMT_2 => {
                let delta_field = header.get_uint(3) as u32;
                let delta = if extended { header.get_u32() } else { delta_field };
                self.timestamp_delta = delta;
                self.timestamp = self.timestamp.wrapping_add(delta);
            }
            CHUNK_FMT_3 => {
                // The 4 extended-timestamp bytes, when present, repeat the
                // stored value; they only need to be consumed.
                if extended {
                    header.advance(4);
                }
                // A fmt=3 header that starts a new message re-applies the
                // previous delta. Continuation chunks leave the timestamp
                // untouched.
                if self.payload.is_empty() {
                    self.timestamp = self.timestamp.wrapping_add(self.timestamp_delta);
                }
            }
            _ => unreachable!(),
        }

        if fmt != CHUNK_FMT_3 {
            self.extended_timestamp = extended;
        }
        self.header_done = true;
        Ok(HeaderProgress::Done)
    }

    /// Read up to one chunk's worth of payload into the accumulator
    ///
    /// The planned read is `min(chunk_size, message_length - received)`
    /// bytes and is all-or-nothing: if the buffer holds fewer, nothing is
    /// consumed and `NeedMore` is returned.
    pub fn read_payload(&mut self, chunk_size: u32, buf: &mut ByteBuffer) -> PayloadProgress {
        let remaining = self.message_length as usize - self.payload.len();
        let planned = remaining.min(chunk_size as usize);

        // A zero-length message completes with an empty payload.
        if planned == 0 {
            self.header_done = false;
            return PayloadProgress::Complete;
        }

        if !buf.require(planned) {
            return PayloadProgress::NeedMore;
        }

        let data = buf.consume(planned);
        self.payload.put_slice(&data);
        self.header_done = false;

        if self.payload.len() == self.message_length as usize {
            PayloadProgress::Complete
        } else {
            PayloadProgress::ChunkBoundary
        }
    }

    /// Whether the accumulator holds a complete message
    pub fn is_ready(&self) -> bool {
        self.payload.len() == self.message_length as usize
    }

    /// Message length announced by the current header
    pub fn message_length(&self) -> u32 {
        self.message_length
    }

    /// Hand out the completed message and clear the in-progress state
    ///
    /// The cached header fields survive so later fmt > 0 headers on this
    /// csid can inherit from them.
    pub fn take_message(&mut self, csid: u32) -> MessagePayload {
        let payload = self.payload.split().freeze();
        MessagePayload {
            csid,
            timestamp: self.timestamp,
            type_id: self.type_id,
            message_stream_id: self.message_stream_id,
            payload,
        }
    }

    /// Discard the in-progress message, keeping the cached header fields
    pub fn reset(&mut self) {
        self.payload.clear();
        self.header_done = false;
    }
}

/// Chunk stream decoder
///
/// Owns the `csid -> ChunkStream` map and the basic-header scratch state,
/// and drives header/payload reads until whole messages fall out.
pub struct ChunkDecoder {
    /// Inbound chunk size (mutated by Set Chunk Size)
    chunk_size: u32,
    /// Per-chunk-stream assembler state
    streams: HashMap<u32, ChunkStream>,
    /// Basic header of the chunk currently being read, if already parsed
    pending: Option<(u8, u32)>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    /// Create a new decoder with the protocol-default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            pending: None,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the inbound chunk size (on receiving Set Chunk Size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
    }

    /// Current inbound chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Try to decode one complete message from the buffer
    ///
    /// Returns `Ok(Some(message))` when a message completed, `Ok(None)` when
    /// more bytes are needed, or `Err` on a protocol violation. Callers loop
    /// until `Ok(None)` to drain buffered input.
    pub fn decode(&mut self, buf: &mut ByteBuffer) -> Result<Option<MessagePayload>> {
        loop {
            let (fmt, csid) = match self.pending {
                Some(scratch) => scratch,
                None => match parse_basic_header(buf.peek())? {
                    Some((fmt, csid, len)) => {
                        buf.consume(len);
                        self.pending = Some((fmt, csid));
                        (fmt, csid)
                    }
                    None => return Ok(None),
                },
            };

            let stream = self.streams.entry(csid).or_default();

            match stream.read_header(fmt, buf)? {
                HeaderProgress::NeedMore => return Ok(None),
                HeaderProgress::Done => {}
            }

            if stream.message_length() > self.max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: stream.message_length(),
                    max: self.max_message_size,
                }
                .into());
            }

            match stream.read_payload(self.chunk_size, buf) {
                PayloadProgress::NeedMore => return Ok(None),
                PayloadProgress::ChunkBoundary => {
                    // Message incomplete; the next chunk (possibly on a
                    // different csid) starts with a fresh basic header.
                    self.pending = None;
                }
                PayloadProgress::Complete => {
                    self.pending = None;
                    return Ok(Some(stream.take_message(csid)));
                }
            }
        }
    }

    /// Discard the partial message on a chunk stream (on Abort)
    pub fn abort(&mut self, csid: u32) {
        if let Some(stream) = self.streams.get_mut(&csid) {
            stream.reset();
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a basic header from the head of `buf` without consuming
///
/// Returns `(fmt, csid, header_length)`, or `None` if the buffer does not
/// hold the complete basic header yet.
fn parse_basic_header(buf: &[u8]) -> Result<Option<(u8, u32, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let first = buf[0];
    let fmt = (first >> 6) & 0x03;
    let csid_low = first & 0x3F;

    match csid_low {
        0 => {
            // 2-byte form: csid = 64 + second byte
            if buf.len() < 2 {
                return Ok(None);
            }
            Ok(Some((fmt, 64 + buf[1] as u32, 2)))
        }
        1 => {
            // 3-byte form: csid = 64 + second + third*256
            if buf.len() < 3 {
                return Ok(None);
            }
            let csid = 64 + buf[1] as u32 + (buf[2] as u32) * 256;
            Ok(Some((fmt, csid, 3)))
        }
        _ => Ok(Some((fmt, csid_low as u32, 1))),
    }
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}

/// Chunk stream encoder
///
/// Splits outgoing messages into chunks, compressing headers against the
/// previous message on the same csid.
pub struct ChunkEncoder {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Last-sent header fields per csid, for format selection
    streams: HashMap<u32, EncoderState>,
}

#[derive(Debug, Clone, Default)]
struct EncoderState {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    type_id: u8,
    message_stream_id: u32,
    primed: bool,
}

impl ChunkEncoder {
    /// Create a new encoder with the protocol-default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the outgoing chunk size (announce with Set Chunk Size first)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
    }

    /// Current outgoing chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into chunks, appending to `buf`
    pub fn encode(&mut self, message: &MessagePayload, buf: &mut BytesMut) {
        let csid = message.csid;
        let chunk_size = self.chunk_size as usize;
        let payload_len = message.payload.len();

        let state = self.streams.entry(csid).or_default();
        let fmt = select_format(message, state);

        let needs_extended = message.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let timestamp_field = if needs_extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            message.timestamp
        };
        let delta = message.timestamp.wrapping_sub(state.timestamp);
        let delta_field = if needs_extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            delta
        };

        state.timestamp = message.timestamp;
        state.timestamp_delta = delta;
        state.message_length = payload_len as u32;
        state.type_id = message.type_id;
        state.message_stream_id = message.message_stream_id;
        state.primed = true;

        let mut offset = 0;
        let mut first_chunk = true;

        loop {
            let chunk_len = (payload_len - offset).min(chunk_size);

            write_basic_header(csid, if first_chunk { fmt } else { CHUNK_FMT_3 }, buf);

            if first_chunk {
                match fmt {
                    CHUNK_FMT_0 => {
                        put_u24(buf, timestamp_field);
                        put_u24(buf, payload_len as u32);
                        buf.put_u8(message.type_id);
                        buf.put_u32_le(message.message_stream_id);
                    }
                    CHUNK_FMT_1 => {
                        put_u24(buf, delta_field);
                        put_u24(buf, payload_len as u32);
                        buf.put_u8(message.type_id);
                    }
                    CHUNK_FMT_2 => {
                        put_u24(buf, delta_field);
                    }
                    _ => {}
                }
            }

            // Continuation chunks repeat the extended timestamp.
            if needs_extended {
                buf.put_u32(message.timestamp);
            }

            buf.put_slice(&message.payload[offset..offset + chunk_len]);
            offset += chunk_len;
            first_chunk = false;

            if offset >= payload_len {
                break;
            }
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Select the most compressed header format valid for this message
fn select_format(message: &MessagePayload, state: &EncoderState) -> u8 {
    if !state.primed || message.message_stream_id != state.message_stream_id {
        return CHUNK_FMT_0;
    }

    if message.type_id != state.type_id || message.payload.len() as u32 != state.message_length {
        return CHUNK_FMT_1;
    }

    let delta = message.timestamp.wrapping_sub(state.timestamp);
    if delta == state.timestamp_delta {
        CHUNK_FMT_3
    } else {
        CHUNK_FMT_2
    }
}

fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        let offset = csid - 64;
        buf.put_u8((offset & 0xFF) as u8);
        buf.put_u8(((offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_from(data: &[u8]) -> ByteBuffer {
        let mut buf = ByteBuffer::new();
        buf.append(data);
        buf
    }

    fn decode_all(decoder: &mut ChunkDecoder, buf: &mut ByteBuffer) -> Vec<MessagePayload> {
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_basic_header_parsing() {
        // 1-byte form (csid 2-63)
        let result = parse_basic_header(&[0x03]).unwrap().unwrap();
        assert_eq!(result, (0, 3, 1));

        // 2-byte form (csid 64-319)
        let result = parse_basic_header(&[0x40, 0x00]).unwrap().unwrap();
        assert_eq!(result, (1, 64, 2));

        // 3-byte form: csid = 64 + b0 + 256*b1
        let result = parse_basic_header(&[0x01, 0x00, 0x01]).unwrap().unwrap();
        assert_eq!(result, (0, 320, 3));
        let result = parse_basic_header(&[0x01, 0x05, 0x02]).unwrap().unwrap();
        assert_eq!(result, (0, 64 + 5 + 512, 3));

        // Truncated extension bytes
        assert!(parse_basic_header(&[0x00]).unwrap().is_none());
        assert!(parse_basic_header(&[0x01, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = MessagePayload {
            csid: CSID_COMMAND,
            timestamp: 1000,
            type_id: MSG_COMMAND_AMF0,
            message_stream_id: 0,
            payload: Bytes::from_static(b"test payload data"),
        };

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let mut encoded = BytesMut::new();
        encoder.encode(&original, &mut encoded);

        let mut buf = buffer_from(&encoded);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.csid, original.csid);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.type_id, original.type_id);
        assert_eq!(decoded.message_stream_id, original.message_stream_id);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_chunk_size_update_splits_large_message() {
        // A 6000-byte message at chunk size 4096 arrives as 4096 + 1904.
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        let original = MessagePayload {
            csid: CSID_VIDEO,
            timestamp: 40,
            type_id: MSG_VIDEO,
            message_stream_id: 1,
            payload: Bytes::from(payload.clone()),
        };

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(4096);
        let mut encoded = BytesMut::new();
        encoder.encode(&original, &mut encoded);

        // basic(1) + header(11) + 4096, then basic(1) + 1904
        assert_eq!(encoded.len(), 1 + 11 + 4096 + 1 + 1904);

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(4096);
        let mut buf = buffer_from(&encoded);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn test_fragmented_delivery_any_boundary() {
        // The same byte stream must decode identically no matter how it is
        // fragmented between appends; feed it one byte at a time.
        let messages: Vec<MessagePayload> = (0..4)
            .map(|i| MessagePayload {
                csid: CSID_COMMAND,
                timestamp: i * 20,
                type_id: MSG_COMMAND_AMF0,
                message_stream_id: 0,
                payload: Bytes::from(vec![i as u8; 50 + i as usize * 113]),
            })
            .collect();

        let mut encoder = ChunkEncoder::new();
        let mut encoded = BytesMut::new();
        for msg in &messages {
            encoder.encode(msg, &mut encoded);
        }

        let mut decoder = ChunkDecoder::new();
        let mut buf = ByteBuffer::new();
        let mut decoded = Vec::new();

        for byte in encoded.iter() {
            buf.append(&[*byte]);
            decoded.extend(decode_all(&mut decoder, &mut buf));
        }

        assert_eq!(decoded.len(), messages.len());
        for (got, want) in decoded.iter().zip(&messages) {
            assert_eq!(got.timestamp, want.timestamp);
            assert_eq!(got.payload, want.payload);
        }
    }

    #[test]
    fn test_reparse_on_fresh_decoder_matches() {
        let messages: Vec<MessagePayload> = (0..3)
            .map(|i| MessagePayload {
                csid: CSID_AUDIO,
                timestamp: 100 + i * 21,
                type_id: MSG_AUDIO,
                message_stream_id: 1,
                payload: Bytes::from(vec![0xAB; 300]),
            })
            .collect();

        let mut encoder = ChunkEncoder::new();
        let mut encoded = BytesMut::new();
        for msg in &messages {
            encoder.encode(msg, &mut encoded);
        }

        let mut first = Vec::new();
        let mut buf = buffer_from(&encoded);
        first.extend(decode_all(&mut ChunkDecoder::new(), &mut buf));

        let mut second = Vec::new();
        let mut buf = buffer_from(&encoded);
        second.extend(decode_all(&mut ChunkDecoder::new(), &mut buf));

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.type_id, b.type_id);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_zero_length_message_completes() {
        // fmt=0 on csid 3, length 0, type 20, stream 0: completes with an
        // empty payload and no payload bytes on the wire.
        let header = [0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 20, 0, 0, 0, 0];
        let mut decoder = ChunkDecoder::new();
        let mut buf = buffer_from(&header);

        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.type_id, 20);
        assert!(msg.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extended_timestamp() {
        // fmt=0 with timestamp field 0xFFFFFF and extended bytes
        // 0x01000000 yields absolute timestamp 0x01000000.
        let mut wire = BytesMut::new();
        wire.put_u8(0x04); // fmt=0, csid=4
        put_u24(&mut wire, 0xFFFFFF);
        put_u24(&mut wire, 2); // length
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_u32(0x0100_0000); // extended timestamp
        wire.put_slice(&[0xAA, 0xBB]);

        let mut decoder = ChunkDecoder::new();
        let mut buf = buffer_from(&wire);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.timestamp, 0x0100_0000);

        // Subsequent fmt=3 chunks on the same csid carry the 4 extended
        // bytes before their payload.
        let mut wire = BytesMut::new();
        wire.put_u8(0xC4); // fmt=3, csid=4
        wire.put_u32(0x0100_0000);
        wire.put_slice(&[0xCC, 0xDD]);

        let mut buf = buffer_from(&wire);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(&[0xCC, 0xDD]));
    }

    #[test]
    fn test_header_inheritance_chain() {
        let mut wire = BytesMut::new();

        // fmt=0: ts=1000, len=4, type=8, msid=1
        wire.put_u8(0x04);
        put_u24(&mut wire, 1000);
        put_u24(&mut wire, 4);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[1, 2, 3, 4]);

        // fmt=2: delta=20, inherits length/type/msid
        wire.put_u8(0x84);
        put_u24(&mut wire, 20);
        wire.put_slice(&[5, 6, 7, 8]);

        // fmt=3: repeats everything including the delta
        wire.put_u8(0xC4);
        wire.put_slice(&[9, 10, 11, 12]);

        let mut decoder = ChunkDecoder::new();
        let mut buf = buffer_from(&wire);
        let msgs = decode_all(&mut decoder, &mut buf);

        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].timestamp, 1000);
        assert_eq!(msgs[1].timestamp, 1020);
        assert_eq!(msgs[2].timestamp, 1040);
        assert_eq!(msgs[2].type_id, MSG_AUDIO);
        assert_eq!(msgs[2].message_stream_id, 1);
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        // Message A (csid 4, 200 bytes) is split across two chunks with a
        // complete message B (csid 6) delivered in between. B finishes
        // first; A's assembler keeps its partial payload across the
        // interleave.
        let a_payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let b_payload = [0xEE; 10];

        let mut wire = BytesMut::new();

        // A, chunk 1: fmt=0 header + first 128 bytes
        wire.put_u8(0x04);
        put_u24(&mut wire, 0);
        put_u24(&mut wire, 200);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&a_payload[..128]);

        // B, complete: fmt=0 header + 10 bytes
        wire.put_u8(0x06);
        put_u24(&mut wire, 0);
        put_u24(&mut wire, 10);
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_slice(&b_payload);

        // A, chunk 2: fmt=3 continuation + remaining 72 bytes
        wire.put_u8(0xC4);
        wire.put_slice(&a_payload[128..]);

        let mut decoder = ChunkDecoder::new();
        let mut buf = buffer_from(&wire);
        let msgs = decode_all(&mut decoder, &mut buf);

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].csid, 6);
        assert_eq!(&msgs[0].payload[..], &b_payload[..]);
        assert_eq!(msgs[1].csid, 4);
        assert_eq!(&msgs[1].payload[..], &a_payload[..]);
    }

    #[test]
    fn test_abort_discards_partial_message() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x04);
        put_u24(&mut wire, 0);
        put_u24(&mut wire, 200);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[0u8; 128]); // first chunk only

        let mut decoder = ChunkDecoder::new();
        let mut buf = buffer_from(&wire);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        decoder.abort(4);

        // A fresh message on the same csid decodes cleanly.
        let mut wire = BytesMut::new();
        wire.put_u8(0x04);
        put_u24(&mut wire, 10);
        put_u24(&mut wire, 3);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[7, 8, 9]);

        buf.append(&wire);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(&[7, 8, 9]));
    }
}
