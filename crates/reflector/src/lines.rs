//! Newline framing for watch bodies.

use bytes::{Bytes, BytesMut};

/// Carries a partial trailing line between chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self { Self::default() }

    /// Append `chunk` and drain every complete line, without its `\n` (or `\r\n`).
    /// Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            out.push(line.freeze());
        }
        out
    }

    /// Bytes waiting for their newline.
    pub fn pending(&self) -> usize { self.buf.len() }

    pub fn clear(&mut self) { self.buf.clear() }
}
