//! JPEG marker and multipart boundary scanning
//!
//! Stateless searches over a snapshot of the accumulated bytes. Framing relies
//! on the JPEG Start/End-Of-Image markers rather than per-part headers, since
//! the backend does not guarantee well-formed `Content-Length` headers between
//! the boundary token and the image. Boundary tokens are only used to pick a
//! place to resume searching and are never part of a returned image.

use crate::accumulator::find_subslice;

/// JPEG Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Boundary token used by the dashboard backend's multipart stream
pub const DEFAULT_BOUNDARY: &str = "--frame";

/// Index of the first `(byte0, byte1)` pair at or after `from`.
#[inline]
pub fn find_marker(buf: &[u8], byte0: u8, byte1: u8, from: usize) -> Option<usize> {
    let tail = buf.get(from..)?;
    tail.windows(2)
        .position(|pair| pair[0] == byte0 && pair[1] == byte1)
        .map(|pos| pos + from)
}

/// Index of the first SOI marker at or after `from`
#[inline]
pub fn find_soi(buf: &[u8], from: usize) -> Option<usize> {
    find_marker(buf, SOI[0], SOI[1], from)
}

/// Index of the first EOI marker at or after `from`
#[inline]
pub fn find_eoi(buf: &[u8], from: usize) -> Option<usize> {
    find_marker(buf, EOI[0], EOI[1], from)
}

/// Byte-exact search for an ASCII boundary token at or after `from`.
pub fn find_boundary_token(buf: &[u8], token: &[u8], from: usize) -> Option<usize> {
    if token.is_empty() {
        return None;
    }
    find_subslice(buf, token, from)
}

/// Check if data starts with JPEG SOI marker (0xFFD8)
#[inline]
pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == SOI[0] && data[1] == SOI[1]
}
