//! Byte buffer with head reservation and a read cursor.
//!
//! TigerStyle: Explicit cursors and head room, asserted invariants.
//!
//! Buffers carry message payloads and socket frames. A fresh buffer keeps a
//! small reserved region in front of the content so framing can prepend a
//! length prefix without reallocating. Flag bits tell the network layer how
//! to treat the buffer on the wire.

use crate::constants::BUFFER_HEAD_RESERVE_BYTES;
use crate::error::{Error, Result};

/// Buffer flag bits
pub mod flag {
    /// Close the connection once this buffer has drained
    pub const CLOSE_AFTER_SEND: u8 = 1 << 0;
    /// WebSocket text frame
    pub const WS_TEXT: u8 = 1 << 1;
    /// WebSocket ping frame
    pub const WS_PING: u8 = 1 << 2;
    /// WebSocket pong frame
    pub const WS_PONG: u8 = 1 << 3;
    /// Prepend the framing header of the connection's mode before sending
    pub const NEEDS_FRAMING: u8 = 1 << 4;
}

/// Growable byte buffer with head room, a read cursor, and flag bits.
///
/// Invariant: `0 <= read_pos <= content length`, and `start` bytes of head
/// room sit before the content.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
    read_pos: usize,
    flags: u8,
}

impl Buffer {
    /// Create an empty buffer with the default head reservation
    pub fn new() -> Self {
        Self::with_head_reserve(BUFFER_HEAD_RESERVE_BYTES)
    }

    /// Create an empty buffer reserving `head` prependable bytes
    pub fn with_head_reserve(head: usize) -> Self {
        Self {
            data: vec![0; head],
            start: head,
            read_pos: 0,
            flags: 0,
        }
    }

    /// Append bytes behind the write cursor
    pub fn write_back(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Prepend bytes into the head reservation.
    ///
    /// Fails when the remaining head room is smaller than `bytes`.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.start {
            return Err(Error::internal(format!(
                "buffer head room exhausted: need {}, have {}",
                bytes.len(),
                self.start
            )));
        }
        let at = self.start - bytes.len();
        self.data[at..self.start].copy_from_slice(bytes);
        self.start = at;
        debug_assert!(self.start <= self.data.len());
        Ok(())
    }

    /// Unread content
    pub fn data(&self) -> &[u8] {
        &self.data[self.start + self.read_pos..]
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.data.len() - self.start - self.read_pos
    }

    /// True when no unread bytes remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance the read cursor by `n` bytes
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consume past write cursor");
        let n = n.min(self.len());
        self.read_pos += n;
    }

    /// Remaining prependable head room
    pub fn head_room(&self) -> usize {
        self.start
    }

    /// Drop all content and restore the default head reservation
    pub fn clear(&mut self) {
        self.data.clear();
        self.data.resize(BUFFER_HEAD_RESERVE_BYTES, 0);
        self.start = BUFFER_HEAD_RESERVE_BYTES;
        self.read_pos = 0;
    }

    /// Set a flag bit
    pub fn set_flag(&mut self, f: u8) {
        self.flags |= f;
    }

    /// Test a flag bit
    pub fn has_flag(&self, f: u8) -> bool {
        self.flags & f != 0
    }

    /// All flag bits
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Copy the unread content into an owned vector
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Unread content as UTF-8, lossily
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.data())
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buf = Buffer::new();
        buf.write_back(bytes);
        buf
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        let mut buf = Buffer::new();
        buf.write_back(&bytes);
        buf
    }
}

impl From<&str> for Buffer {
    fn from(text: &str) -> Self {
        Buffer::from(text.as_bytes())
    }
}

impl From<String> for Buffer {
    fn from(text: String) -> Self {
        Buffer::from(text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut buf = Buffer::new();
        buf.write_back(b"hello ");
        buf.write_back(b"world");
        assert_eq!(buf.data(), b"hello world");
        assert_eq!(buf.len(), 11);

        buf.consume(6);
        assert_eq!(buf.data(), b"world");
        assert_eq!(buf.len(), 5);

        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_prepend_uses_head_room() {
        let mut buf = Buffer::with_head_reserve(4);
        buf.write_back(b"payload");
        let before = buf.data().as_ptr() as usize;

        buf.prepend(&[0x00, 0x07]).unwrap();
        assert_eq!(buf.data(), b"\x00\x07payload");
        assert_eq!(buf.head_room(), 2);

        // No reallocation: the content pointer only moved backwards
        let after = buf.data().as_ptr() as usize;
        assert_eq!(before - after, 2);
    }

    #[test]
    fn test_prepend_over_head_room_fails() {
        let mut buf = Buffer::with_head_reserve(1);
        buf.write_back(b"x");
        assert!(buf.prepend(&[1, 2]).is_err());
        // Content untouched on failure
        assert_eq!(buf.data(), b"x");
    }

    #[test]
    fn test_flags() {
        let mut buf = Buffer::new();
        assert!(!buf.has_flag(flag::NEEDS_FRAMING));
        buf.set_flag(flag::NEEDS_FRAMING);
        buf.set_flag(flag::CLOSE_AFTER_SEND);
        assert!(buf.has_flag(flag::NEEDS_FRAMING));
        assert!(buf.has_flag(flag::CLOSE_AFTER_SEND));
        assert!(!buf.has_flag(flag::WS_TEXT));
    }

    #[test]
    fn test_clear_restores_head_room() {
        let mut buf = Buffer::with_head_reserve(2);
        buf.write_back(b"abc");
        buf.prepend(&[1, 2]).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.head_room(), BUFFER_HEAD_RESERVE_BYTES);
    }
}
