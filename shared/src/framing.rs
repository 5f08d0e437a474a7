//! Newline framing for the per-channel byte stream.
//!
//! A QUIC stream delivers an ordered sequence of bytes with no message
//! boundaries. Each channel owns one [`FrameBuffer`]; received chunks are
//! pushed into it and complete `\n`-terminated messages are pulled back out
//! lazily through [`Frames`]. Whatever follows the last delimiter stays
//! buffered until the next delivery, so the same messages come out no matter
//! how the stream was chunked.

use crate::MESSAGE_DELIMITER;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A message grew past the configured limit. Its bytes are discarded up to
    /// and including the next delimiter.
    #[error("message of at least {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },
}

/// Receive accumulator for one channel.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Offset of the first unconsumed byte.
    start: usize,
    /// Bytes after `start` already known not to contain a delimiter.
    scanned: usize,
    max_len: Option<usize>,
    /// Set while skipping the remainder of an oversized message.
    discarding: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer that rejects messages longer than `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            ..Self::default()
        }
    }

    /// Appends a received chunk and returns the messages it completed.
    ///
    /// The returned iterator is lazy. Dropping it early leaves the remaining
    /// messages buffered; [`FrameBuffer::frames`] resumes where it stopped.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.compact();
        self.buf.extend_from_slice(chunk);
        Frames { buffer: self }
    }

    /// Iterates messages already buffered without adding new bytes.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { buffer: self }
    }

    /// Number of buffered bytes not yet returned as a message.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        self.discarding = false;
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        loop {
            let unscanned = &self.buf[self.start + self.scanned..];
            match unscanned.iter().position(|&b| b == MESSAGE_DELIMITER) {
                Some(offset) => {
                    let end = self.start + self.scanned + offset;
                    let begin = self.start;
                    let skipping = self.discarding;

                    self.start = end + 1;
                    self.scanned = 0;
                    self.discarding = false;

                    if skipping || end == begin {
                        continue;
                    }

                    let len = end - begin;
                    if let Some(max) = self.max_len {
                        if len > max {
                            return Some(Err(FrameError::Oversized { len, max }));
                        }
                    }
                    return Some(Ok(self.buf[begin..end].to_vec()));
                }
                None => {
                    self.scanned = self.buf.len() - self.start;

                    if self.discarding {
                        self.start = self.buf.len();
                        self.scanned = 0;
                        return None;
                    }

                    if let Some(max) = self.max_len {
                        let len = self.pending();
                        if len > max {
                            self.discarding = true;
                            self.start = self.buf.len();
                            self.scanned = 0;
                            return Some(Err(FrameError::Oversized { len, max }));
                        }
                    }
                    return None;
                }
            }
        }
    }
}

/// Lazy sequence of complete messages drawn from a [`FrameBuffer`].
pub struct Frames<'a> {
    buffer: &'a mut FrameBuffer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Vec<u8>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.next_frame()
    }
}
