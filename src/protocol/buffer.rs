//! Receive-side byte accumulator
//!
//! The session appends whatever the socket delivered and the parsers pull
//! structured data back out. `require` returning false is not an error; it
//! tells the caller to wait for the next read. Consuming advances a cursor
//! inside the underlying `BytesMut` without copying the remainder.

use bytes::{BufMut, BytesMut};

/// Append-biased byte buffer with peek/require/consume semantics
#[derive(Debug, Default)]
pub struct ByteBuffer {
    buf: BytesMut,
}

impl ByteBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Create a buffer with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append bytes at the write end
    pub fn append(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Check that at least `n` bytes are available from the read cursor
    pub fn require(&self, n: usize) -> bool {
        self.buf.len() >= n
    }

    /// View all unconsumed bytes without advancing the cursor
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Advance the read cursor by `n` bytes, returning them
    ///
    /// Panics if fewer than `n` bytes are available; callers gate on
    /// `require` first.
    pub fn consume(&mut self, n: usize) -> BytesMut {
        self.buf.split_to(n)
    }

    /// Discard everything, including unconsumed bytes
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of unconsumed bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no unconsumed bytes
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
