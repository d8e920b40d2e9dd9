//! Byte stream to text line framing.
//!
//! The rig MCU writes newline-terminated ASCII records, but a serial read may
//! return half a record or several at once. `LineFramer` buffers whatever has
//! arrived and yields complete, trimmed lines.

use bytes::{Buf, BytesMut};
use tracing::warn;

/// Records longer than this without a terminator are line noise.
pub const MAX_LINE_LEN: usize = 4096;

/// Accumulates raw bytes and splits them on `\n`.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    /// Empty framer with room for a typical telemetry record.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.enforce_limit();
    }

    /// Drop an unterminated tail longer than `MAX_LINE_LEN`. Complete lines
    /// ahead of it are kept. Returns the number of bytes discarded.
    pub fn enforce_limit(&mut self) -> usize {
        let tail_start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let tail = self.buf.len() - tail_start;
        if tail <= MAX_LINE_LEN {
            return 0;
        }
        warn!(
            discarded = tail,
            "Dropping unterminated input longer than {} bytes", MAX_LINE_LEN
        );
        self.buf.truncate(tail_start);
        tail
    }

    /// Mutable access for `AsyncReadExt::read_buf`.
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pop the next complete non-empty line, trimmed of whitespace and `\r`.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos);
            self.buf.advance(1);
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
