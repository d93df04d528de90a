//! Synthetic MJPEG stream generation for testing
//!
//! Generates multipart streams of small, distinct JPEG images so tests can
//! check that extracted frames are byte-identical to what was sent.
//!
//! # Example
//!
//! ```rust,ignore
//! use camstream_lib::test_utils::MjpegStreamGenerator;
//!
//! let mut gen = MjpegStreamGenerator::new(512);
//!
//! // Three parts, each `--frame` + headers + JPEG
//! let (bytes, images) = gen.stream(3);
//!
//! // Split the way a network might deliver it
//! let chunks = gen.chunk(&bytes);
//! ```

use bytes::Bytes;

use crate::scanner::DEFAULT_BOUNDARY;

/// Generates multipart MJPEG byte streams
#[derive(Debug, Clone)]
pub struct MjpegStreamGenerator {
    boundary: String,
    chunk_size: usize,
    next_seed: u8,
}

impl Default for MjpegStreamGenerator {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MjpegStreamGenerator {
    /// Create a generator that splits streams into `chunk_size`-byte chunks
    pub fn new(chunk_size: usize) -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            chunk_size: chunk_size.max(1),
            next_seed: 0,
        }
    }

    /// Use a different multipart boundary
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    /// Boundary placed before each part
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Generate the next JPEG image.
    ///
    /// Each call returns different bytes. The only `FF D8` / `FF D9` pairs
    /// are the leading SOI and trailing EOI.
    pub fn jpeg(&mut self) -> Vec<u8> {
        let seed = self.next_seed;
        self.next_seed = self.next_seed.wrapping_add(1);

        let mut jpeg = vec![
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, 0x00, 0x10, // APP0 length
            0x4A, 0x46, 0x49, 0x46, 0x00, // "JFIF\0"
            0x01, 0x01, // version
            0x00, // aspect ratio units
            0x00, 0x01, // X density
            0x00, 0x01, // Y density
            0x00, 0x00, // thumbnail size
        ];

        // Quantization table, values derived from the seed
        jpeg.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
        jpeg.extend_from_slice(&[1 + seed % 0xFE; 64]);

        // SOF0 (8x8 image, YCbCr)
        jpeg.extend_from_slice(&[
            0xFF, 0xC0, 0x00, 0x11, // SOF0, length
            0x08, // precision
            0x00, 0x08, // height = 8
            0x00, 0x08, // width = 8
            0x03, // components
            0x01, 0x11, 0x00, // Y
            0x02, 0x11, 0x00, // Cb
            0x03, 0x11, 0x00, // Cr
        ]);

        // Start of Scan
        jpeg.extend_from_slice(&[
            0xFF, 0xDA, 0x00, 0x0C, // SOS, length
            0x03, // components
            0x01, 0x00, 0x02, 0x00, 0x03, 0x00, // table selectors
            0x00, 0x3F, 0x00, // spectral selection
        ]);

        // Scan data with no 0xFF bytes, varying in length
        let scan_len = 16 + usize::from(seed % 32);
        jpeg.extend((0..scan_len).map(|i| ((usize::from(seed) + i) % 0xFF) as u8));

        // EOI
        jpeg.extend_from_slice(&[0xFF, 0xD9]);

        jpeg
    }

    /// Generate the next JPEG image with a COM segment holding `comment`.
    ///
    /// Useful for payloads whose metadata contains text such as the boundary.
    pub fn jpeg_with_comment(&mut self, comment: &[u8]) -> Vec<u8> {
        let mut jpeg = self.jpeg();
        let len = u16::try_from(comment.len() + 2).unwrap_or(u16::MAX);
        let mut segment = vec![0xFF, 0xFE];
        segment.extend_from_slice(&len.to_be_bytes());
        segment.extend_from_slice(comment);
        // Right after APP0
        jpeg.splice(20..20, segment);
        jpeg
    }

    /// Wrap `jpeg` in one multipart part (boundary, headers, body, CRLF)
    pub fn part(&self, jpeg: &[u8]) -> Vec<u8> {
        let mut part = format!(
            "{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            self.boundary,
            jpeg.len()
        )
        .into_bytes();
        part.extend_from_slice(jpeg);
        part.extend_from_slice(b"\r\n");
        part
    }

    /// Generate a stream of `frames` parts.
    ///
    /// Returns the concatenated stream bytes and the JPEG images in order.
    pub fn stream(&mut self, frames: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut bytes = Vec::new();
        let mut images = Vec::with_capacity(frames);
        for _ in 0..frames {
            let jpeg = self.jpeg();
            bytes.extend_from_slice(&self.part(&jpeg));
            images.push(jpeg);
        }
        (bytes, images)
    }

    /// Split `bytes` into chunks of the configured size
    pub fn chunk(&self, bytes: &[u8]) -> Vec<Bytes> {
        bytes
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect()
    }
}

/// Split `bytes` at the given offsets.
///
/// Offsets beyond the end are ignored; empty pieces are dropped.
pub fn split_at_offsets(bytes: &[u8], offsets: &[usize]) -> Vec<Bytes> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for &offset in offsets {
        let offset = offset.min(bytes.len());
        if offset > start {
            pieces.push(Bytes::copy_from_slice(&bytes[start..offset]));
            start = offset;
        }
    }
    if start < bytes.len() {
        pieces.push(Bytes::copy_from_slice(&bytes[start..]));
    }
    pieces
}
