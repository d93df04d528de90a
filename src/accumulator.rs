//! Bounded byte accumulator for inbound stream chunks
//!
//! Network chunks arrive with arbitrary boundaries, so bytes are gathered here
//! until the frame extractor can find a complete image. The buffer enforces a
//! hard ceiling: a stream that never produces a frame must fail instead of
//! growing memory without limit.

use thiserror::Error;

/// Default ceiling for retained bytes (8 MiB)
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Errors raised by [`ByteAccumulator`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Appending would push the buffer past its ceiling.
    #[error("buffer overflow: {len} bytes would exceed the {limit} byte ceiling")]
    Overflow {
        /// Size the buffer would have reached after the append.
        len: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// Tried to consume more bytes than are buffered.
    #[error("invalid range: cannot consume {requested} of {available} buffered bytes")]
    InvalidRange {
        /// Number of bytes the caller asked to discard.
        requested: usize,
        /// Number of bytes currently buffered.
        available: usize,
    },
}

/// Growable, bounded byte buffer supporting append, prefix trimming and search
#[derive(Debug)]
pub struct ByteAccumulator {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for ByteAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl ByteAccumulator {
    /// Create an empty accumulator that refuses to hold more than `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len.min(256 * 1024)),
            max_len,
        }
    }

    /// Copy `chunk` onto the end of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`] if the resulting length would exceed
    /// the ceiling. The buffer is left untouched in that case.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        let len = self.buffer.len().saturating_add(chunk.len());
        if len > self.max_len {
            return Err(BufferError::Overflow {
                len,
                limit: self.max_len,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Discard the first `n` bytes, keeping the remainder in order.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidRange`] if `n` is larger than the
    /// current length.
    pub fn consume(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.buffer.len() {
            return Err(BufferError::InvalidRange {
                requested: n,
                available: self.buffer.len(),
            });
        }
        self.buffer.drain(..n);
        Ok(())
    }

    /// Byte-exact search for `pattern` starting at `from`
    pub fn find(&self, pattern: &[u8], from: usize) -> Option<usize> {
        find_subslice(&self.buffer, pattern, from)
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Configured ceiling
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// First index `>= from` where `needle` occurs in `haystack`.
///
/// An empty needle matches at `from` as long as `from` is within bounds.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    let tail = haystack.get(from..)?;
    if needle.is_empty() {
        return Some(from);
    }
    tail.windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
