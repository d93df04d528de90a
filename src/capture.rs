//! Stream chunk capture for debugging and offline replay.
//!
//! A [`ChunkRecorder`] can be attached to a session to record the raw HTTP
//! body exactly as the network delivered it, chunk boundaries included.
//! Captures can be replayed later through [`crate::replay`] to reproduce
//! framing problems without a live camera.
//!
//! # File Format
//!
//! - `capture_<ts>.bin`: Sequence of `[u64 LE: timestamp_us][u32 LE: length][bytes: data]...`
//! - `capture_<ts>.json`: Camera and capture information
//!
//! # Example
//!
//! ```ignore
//! let recorder = Arc::new(ChunkRecorder::new());
//! recorder.start_capture(CaptureMetadata {
//!     camera_id: "porch".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let session = AuthenticatedStreamSession::new(..).with_recorder(Arc::clone(&recorder));
//!
//! // When done:
//! let result = recorder.stop_capture(Path::new("/output"))?;
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Largest chunk accepted when reading a capture back
const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Default ceiling for bytes held by one capture
pub const DEFAULT_MAX_CAPTURE_BYTES: u64 = 64 * 1024 * 1024;

/// Errors that can occur during chunk capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Capture file is truncated or corrupt.
    #[error("invalid chunk data at offset {offset}: {message}")]
    InvalidChunk {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and camera.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Camera the stream came from.
    pub camera_id: String,
    /// Multipart boundary token in use when recording.
    #[serde(default)]
    pub boundary: String,
    /// Total number of chunks captured.
    #[serde(default)]
    pub total_chunks: u64,
    /// Total number of complete frames extracted while capturing.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
    /// Chunks were dropped after the recorder's byte limit was reached.
    #[serde(default)]
    pub truncated: bool,
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved chunk file.
    pub chunks_path: String,
    /// Path to the saved metadata file.
    pub metadata_path: String,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// A single recorded body chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChunk {
    /// Time since capture start (microseconds).
    pub timestamp_us: u64,
    /// Raw chunk bytes.
    pub data: Bytes,
}

/// Thread-safe recorder for stream body chunks.
///
/// Recording is a no-op while no capture is active, so a recorder can stay
/// attached to a session permanently. Chunks are held in memory until the
/// capture stops; once the byte limit is reached further chunks are dropped
/// and the capture is marked truncated.
pub struct ChunkRecorder {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Recorded chunks in arrival order.
    chunks: Mutex<Vec<RecordedChunk>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    /// Lock-free chunk counter.
    chunk_count: AtomicU64,
    /// Lock-free byte counter.
    byte_count: AtomicU64,
    /// Ceiling for recorded bytes.
    max_bytes: u64,
}

impl ChunkRecorder {
    /// Creates a recorder with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_CAPTURE_BYTES)
    }

    /// Creates a recorder that keeps at most `max_bytes` of chunk data per capture.
    #[must_use]
    pub fn with_limit(max_bytes: u64) -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            chunk_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            max_bytes,
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current chunk count.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        lock(&self.chunks).clear();
        self.chunk_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        *lock(&self.start_time) = Some(Instant::now());
        *lock(&self.metadata) = metadata;

        log::info!("Chunk capture started");
        Ok(())
    }

    /// Records a chunk. Ignored unless a capture is active.
    pub fn record_chunk(&self, chunk: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        let start_time = *lock(&self.start_time);
        let timestamp_us = start_time
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);

        let len = chunk.len() as u64;
        let mut chunks = lock(&self.chunks);
        if self.byte_count.load(Ordering::Relaxed).saturating_add(len) > self.max_bytes {
            drop(chunks);
            let mut meta = lock(&self.metadata);
            if !meta.truncated {
                meta.truncated = true;
                log::warn!(
                    "Capture limit of {} bytes reached, dropping further chunks",
                    self.max_bytes
                );
            }
            return;
        }

        self.chunk_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(len, Ordering::Relaxed);
        chunks.push(RecordedChunk {
            timestamp_us,
            data: Bytes::copy_from_slice(chunk),
        });
    }

    /// Increments the frame counter in metadata.
    pub fn record_frame(&self) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }
        lock(&self.metadata).total_frames += 1;
    }

    /// Stops the capture and saves it to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let start_time = *lock(&self.start_time);
        let duration_ms = start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let metadata = {
            let mut meta = lock(&self.metadata);
            meta.duration_ms = duration_ms;
            meta.total_chunks = self.chunk_count.load(Ordering::Acquire);
            meta.total_bytes = self.byte_count.load(Ordering::Acquire);
            meta.clone()
        };

        let chunks = std::mem::take(&mut *lock(&self.chunks));
        let result = write_capture_files(output_dir, &chunks, &metadata)?;

        log::info!(
            "Capture stopped: {} chunks, {} bytes, {} frames, {} ms",
            metadata.total_chunks,
            metadata.total_bytes,
            metadata.total_frames,
            duration_ms
        );
        Ok(result)
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        lock(&self.chunks).clear();
        log::info!("Capture cancelled");
    }
}

impl Default for ChunkRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRecorder")
            .field("is_capturing", &self.is_capturing())
            .field("chunk_count", &self.chunk_count())
            .field("byte_count", &self.byte_count())
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

/// Recorded data stays consistent even if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Writes `capture_<ts>.bin` and `capture_<ts>.json` into `dir`.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
pub fn write_capture_files(
    dir: &Path,
    chunks: &[RecordedChunk],
    metadata: &CaptureMetadata,
) -> Result<CaptureResult> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let chunks_path = dir.join(format!("capture_{}.bin", timestamp));
    let mut file = std::io::BufWriter::new(std::fs::File::create(&chunks_path)?);
    for chunk in chunks {
        file.write_all(&chunk.timestamp_us.to_le_bytes())?;
        file.write_all(&(chunk.data.len() as u32).to_le_bytes())?;
        file.write_all(&chunk.data)?;
    }
    file.flush()?;

    let metadata_path = chunks_path.with_extension("json");
    std::fs::write(&metadata_path, serde_json::to_string_pretty(metadata)?)?;

    log::debug!(
        "Saved {} chunks to {}",
        chunks.len(),
        chunks_path.display()
    );

    Ok(CaptureResult {
        chunks_path: chunks_path.display().to_string(),
        metadata_path: metadata_path.display().to_string(),
        metadata: metadata.clone(),
    })
}

/// Reads chunks from a binary capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read, or
/// `CaptureError::InvalidChunk` if it is truncated or corrupt.
pub fn read_chunks(path: &Path) -> Result<Vec<RecordedChunk>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut chunks = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| CaptureError::InvalidChunk {
                offset,
                message: "unexpected EOF reading chunk length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_CHUNK_BYTES {
            return Err(CaptureError::InvalidChunk {
                offset,
                message: format!("chunk length {} exceeds {} byte limit", len, MAX_CHUNK_BYTES),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidChunk {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        chunks.push(RecordedChunk {
            timestamp_us: u64::from_le_bytes(timestamp_bytes),
            data: Bytes::from(data),
        });
        offset += 8 + 4 + len as u64;
    }

    Ok(chunks)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
