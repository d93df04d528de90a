//! Frame extraction from a multipart MJPEG byte stream
//!
//! Pulls complete JPEG images out of the raw HTTP body so the rest of the
//! client never has to care how the network split the bytes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use camstream_lib::frame_extractor::FrameExtractor;
//!
//! let mut extractor = FrameExtractor::default();
//!
//! while let Some(chunk) = body.next().await {
//!     for frame in extractor.feed(&chunk?)? {
//!         // Complete JPEG received
//!         show(frame);
//!     }
//! }
//! ```

use bytes::Bytes;

use crate::accumulator::{BufferError, ByteAccumulator, DEFAULT_MAX_BUFFER_BYTES};
use crate::scanner::{find_boundary_token, find_eoi, find_soi, DEFAULT_BOUNDARY, EOI, SOI};

/// One complete JPEG image, `SOI` through `EOI` inclusive
///
/// Cloning is cheap; the underlying bytes are shared and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    sequence: u64,
}

impl Frame {
    /// Wrap already-extracted image bytes
    pub fn new(data: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            data: data.into(),
            sequence,
        }
    }

    /// Image bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the image bytes
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Size of the image in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty (never true for extracted frames)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 1-based position of this frame in its stream
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Where the extractor is within the current image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// No image in progress; looking for the next SOI
    SeekingStart,
    /// An SOI is buffered at offset 0; waiting for its EOI
    SeekingEnd,
}

/// Extracts JPEG frames from arbitrarily split stream chunks
///
/// Boundary tokens are advisory. Framing is decided by SOI/EOI markers, and
/// misplaced markers are resynchronised locally instead of failing the stream.
/// Each buffered byte is scanned a bounded number of times, however the
/// stream is split.
#[derive(Debug)]
pub struct FrameExtractor {
    /// Bytes received but not yet part of an emitted frame
    accumulator: ByteAccumulator,
    /// Multipart boundary token, e.g. `--frame`
    boundary: Vec<u8>,
    /// Current phase of the scan
    phase: ScanPhase,
    /// Offset where the next marker search resumes within the current phase
    scanned: usize,
    /// Frames emitted since creation or the last reset
    frames_emitted: u64,
    /// Times bytes were discarded to recover from malformed input
    resyncs: u64,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES, DEFAULT_BOUNDARY)
    }
}

impl FrameExtractor {
    /// Create a new extractor
    ///
    /// # Arguments
    /// * `max_buffer_bytes` - Ceiling for bytes held while waiting for a frame to complete.
    /// * `boundary` - Multipart boundary token. An empty token disables boundary hints.
    pub fn new(max_buffer_bytes: usize, boundary: &str) -> Self {
        Self {
            accumulator: ByteAccumulator::new(max_buffer_bytes),
            boundary: boundary.as_bytes().to_vec(),
            phase: ScanPhase::SeekingStart,
            scanned: 0,
            frames_emitted: 0,
            resyncs: 0,
        }
    }

    /// Append `chunk` and return every frame that is now complete, in stream order.
    ///
    /// Incomplete data stays buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`] when the chunk cannot be buffered
    /// without exceeding the ceiling. The stream should be abandoned.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, BufferError> {
        self.accumulator.append(chunk)?;

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        if frames.len() > 1 {
            log::debug!("Extracted {} frames from one chunk", frames.len());
        }
        Ok(frames)
    }

    /// One scan pass: emit the first complete image, or stop for more data
    fn next_frame(&mut self) -> Result<Option<Frame>, BufferError> {
        if self.phase == ScanPhase::SeekingStart && !self.seek_start()? {
            return Ok(None);
        }
        self.seek_end()
    }

    /// Move the next SOI to offset 0 and switch to [`ScanPhase::SeekingEnd`].
    ///
    /// Returns `false` when no SOI is buffered yet. Bytes past the last
    /// boundary token are kept so a marker split across chunks is still found.
    fn seek_start(&mut self) -> Result<bool, BufferError> {
        loop {
            let buf = self.accumulator.as_slice();
            let soi = find_soi(buf, self.scanned);

            // Only a token ahead of the SOI moves the search floor
            let limit = soi.unwrap_or(buf.len());
            let token_from = self
                .scanned
                .saturating_sub(self.boundary.len().saturating_sub(1));
            if let Some(token_at) = find_boundary_token(&buf[..limit], &self.boundary, token_from)
            {
                self.accumulator.consume(token_at + self.boundary.len())?;
                self.scanned = 0;
                continue;
            }

            let Some(soi) = soi else {
                self.scanned = buf.len().saturating_sub(1);
                return Ok(false);
            };

            // EOI ahead of the SOI is the tail of an image we never saw start
            if find_eoi(&buf[..=soi], 0).is_some() {
                log::debug!("Misordered EOI before SOI at {} - resyncing", soi);
                self.resyncs += 1;
            }

            self.accumulator.consume(soi)?;
            self.phase = ScanPhase::SeekingEnd;
            self.scanned = SOI.len();
            return Ok(true);
        }
    }

    /// Emit the image at offset 0 once its EOI is buffered
    fn seek_end(&mut self) -> Result<Option<Frame>, BufferError> {
        let buf = self.accumulator.as_slice();
        let Some(eoi) = find_eoi(buf, self.scanned) else {
            // Resume one byte back in case the EOI is split across chunks
            self.scanned = buf.len().saturating_sub(1).max(SOI.len());
            return Ok(None);
        };

        let end = eoi + EOI.len();
        let data = Bytes::copy_from_slice(&buf[..end]);
        self.accumulator.consume(end)?;
        self.phase = ScanPhase::SeekingStart;
        self.scanned = 0;
        self.frames_emitted += 1;

        log::trace!(
            "Complete MJPEG frame #{}: {} bytes",
            self.frames_emitted,
            data.len()
        );
        Ok(Some(Frame::new(data, self.frames_emitted)))
    }

    /// Reset the extractor state
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.phase = ScanPhase::SeekingStart;
        self.scanned = 0;
        self.frames_emitted = 0;
        self.resyncs = 0;
    }

    /// Get current buffer size (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.accumulator.len()
    }

    /// Current scan phase
    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Number of frames emitted so far
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Number of resynchronisations after malformed input
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}
