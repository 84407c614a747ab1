//! Line assembly for device output.
//!
//! The Pico prints newline-terminated log lines but leaves interactive
//! prompts (`Select option: `) unterminated.  [`LineAssembler`] splits at
//! `\n` and lets the caller flush a partial line when the port goes quiet.

/// A partial line longer than this is emitted without waiting for `\n`.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accumulates raw bytes and yields complete lines, terminator included.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line they complete, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            self.pending.push(byte);
            if byte == b'\n' || self.pending.len() >= MAX_LINE_BYTES {
                lines.push(std::mem::take(&mut self.pending));
            }
        }
        lines
    }

    /// Take the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
