//! Hex-pair byte strings and the response stream cursor.
//!
//! The hub exposes its response buffer as a string of hex pairs. `HexString`
//! is the immutable decoded form; `ResponseStream` is the moving window the
//! dispatcher reads headers and bodies through. The stream only ever moves
//! forward except for an explicit `reset`, which models a hub-side buffer
//! clear.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors from decoding hub buffer payloads.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HexStreamError {
    /// The payload contained a non-hex character or an odd digit count.
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
}

/// An immutable byte string decoded from hex pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HexString(Vec<u8>);

impl HexString {
    /// Decode a hex-pair string. An odd trailing digit is truncated: the hub
    /// snapshots its ring buffer mid-write and a half pair only means the
    /// writer got there first.
    pub fn parse(s: &str) -> Result<Self, HexStreamError> {
        let trimmed = s.trim();
        // the truncation below slices by byte index, which is only safe on
        // single-byte characters; anything non-ASCII is not hex anyway
        if !trimmed.is_ascii() {
            return Err(HexStreamError::InvalidHex(trimmed.to_string()));
        }
        let even = &trimmed[..trimmed.len() - (trimmed.len() % 2)];
        let bytes = hex::decode(even).map_err(|e| HexStreamError::InvalidHex(e.to_string()))?;
        Ok(HexString(bytes))
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        HexString(bytes.into())
    }

    /// Decoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of decoded bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// A forward-only cursor over the hub's response bytes.
///
/// The dispatcher appends freshly fetched bytes at the tail and consumes from
/// the head; `peek` gives bounded look-ahead without consuming, which the
/// buffer-wrap recovery heuristic relies on.
#[derive(Debug, Default)]
pub struct ResponseStream {
    buf: Vec<u8>,
    pos: usize,
}

impl ResponseStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded bytes at the tail.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes available to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Total bytes ever ingested (consumed or not).
    pub fn total_len(&self) -> usize {
        self.buf.len()
    }

    /// Look at the byte `offset` positions ahead of the cursor without
    /// consuming it.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        self.buf.get(self.pos + offset).copied()
    }

    /// Borrow `len` bytes starting `offset` ahead of the cursor, or `None`
    /// when that many are not available yet.
    pub fn peek_slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let start = self.pos + offset;
        let end = start.checked_add(len)?;
        self.buf.get(start..end)
    }

    /// Consume and return the next byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        let b = self.buf.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    /// Consume and return the next `len` bytes as an owned vector, or `None`
    /// (consuming nothing) when fewer are available.
    pub fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let slice = self.peek_slice(0, len)?.to_vec();
        self.pos += len;
        Some(slice)
    }

    /// Skip `n` bytes forward, clamped at the tail.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Drop everything, cursor included. Used after a hub-side buffer clear:
    /// anything we had ingested no longer lines up with the hub's state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}
