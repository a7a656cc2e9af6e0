//! Session output buffer with a consumption cursor.
//!
//! Every byte read from the shell is appended in arrival order and kept for
//! the lifetime of the session. Matches and lines advance a cursor instead of
//! removing data, so diagnostics can still show the full transcript.

use std::borrow::Cow;
use std::ops::Range;

use memchr::memchr;

use super::patterns::Pattern;

/// Accumulated output of an interactive session.
#[derive(Debug)]
pub struct SessionBuffer {
    /// Everything read so far.
    buffer: Vec<u8>,

    /// Offset of the first byte not yet consumed by a match or line read.
    consumed: usize,
}

impl SessionBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            consumed: 0,
        }
    }

    /// Append freshly read data.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes that have not been consumed yet.
    pub fn unconsumed(&self) -> &[u8] {
        &self.buffer[self.consumed..]
    }

    /// Unconsumed bytes as a string (lossy UTF-8 conversion).
    pub fn unconsumed_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.unconsumed())
    }

    /// Search the unconsumed region for `pattern`.
    ///
    /// The returned range is relative to [`unconsumed`](Self::unconsumed).
    pub fn find(&self, pattern: &Pattern) -> Option<Range<usize>> {
        pattern.find(self.unconsumed())
    }

    /// Consume `len` bytes from the cursor, returning them as text.
    pub fn consume(&mut self, len: usize) -> String {
        let end = (self.consumed + len).min(self.buffer.len());
        let text = String::from_utf8_lossy(&self.buffer[self.consumed..end]).into_owned();
        self.consumed = end;
        text
    }

    /// Consume the next complete line, without its `\n` or `\r\n` terminator.
    ///
    /// Returns `None` if no newline has arrived yet.
    pub fn take_line(&mut self) -> Option<String> {
        let pos = memchr(b'\n', self.unconsumed())?;
        let mut line = self.consume(pos + 1);
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Full transcript, including consumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Total number of bytes read.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing has been read yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for SessionBuffer {
    fn default() -> Self {
        Self::new()
    }
}
