//! Stream replay for testing without a camera backend.
//!
//! Replays chunks recorded by [`crate::capture::ChunkRecorder`] with their
//! original chunk boundaries, either straight through a [`FrameExtractor`]
//! or as a [`StreamTransport`] so the full session/controller pipeline runs
//! against recorded data.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use camstream_lib::replay::{ChunkReplay, ReplayConfig};
//!
//! let replay = ChunkReplay::load(Path::new("capture_12345.bin"))?;
//! let transport = Arc::new(replay.into_transport(ReplayConfig::default()));
//!
//! let mut controller = CameraStreamController::new(camera, stream, credentials, transport, presenter);
//! controller.set_enabled(true);
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::accumulator::{BufferError, DEFAULT_MAX_BUFFER_BYTES};
use crate::capture::{read_chunks, read_metadata, CaptureError, CaptureMetadata, RecordedChunk};
use crate::frame_extractor::{Frame, FrameExtractor};
use crate::scanner::DEFAULT_BOUNDARY;
use crate::transport::{ChunkStream, StreamResponse, StreamTransport, TransportError};

/// Errors that can occur during replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read.
    #[error("failed to load capture: {0}")]
    Capture(#[from] CaptureError),

    /// The recorded stream overflowed the frame buffer.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for chunk replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

/// A loaded capture ready for replay.
#[derive(Debug, Clone)]
pub struct ChunkReplay {
    /// Recorded chunks in arrival order.
    chunks: Arc<[RecordedChunk]>,
    /// Optional metadata from the companion `.json` file.
    metadata: Option<CaptureMetadata>,
}

impl ChunkReplay {
    /// Load a capture file and its companion metadata.
    ///
    /// Metadata is optional; a missing or unreadable `.json` is logged and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Capture`] if the chunk file cannot be opened
    /// or is corrupt.
    pub fn load(path: &Path) -> Result<Self> {
        let chunks = read_chunks(path)?;

        let json_path = path.with_extension("json");
        let metadata = match read_metadata(&json_path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::debug!("No metadata at {}: {}", json_path.display(), e);
                None
            }
        };

        log::info!("Loaded {} chunks from {}", chunks.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: camera '{}', {} frames, {} bytes, {} ms",
                meta.camera_id,
                meta.total_frames,
                meta.total_bytes,
                meta.duration_ms
            );
        }

        Ok(Self::from_chunks(chunks, metadata))
    }

    /// Replay already-loaded chunks
    pub fn from_chunks(chunks: Vec<RecordedChunk>, metadata: Option<CaptureMetadata>) -> Self {
        Self {
            chunks: chunks.into(),
            metadata,
        }
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Recorded chunks
    #[must_use]
    pub fn chunks(&self) -> &[RecordedChunk] {
        &self.chunks
    }

    /// Get the number of loaded chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Get the total duration of the capture in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.chunks
            .last()
            .map(|c| c.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Boundary recorded in the metadata, or the default
    #[must_use]
    pub fn boundary(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.boundary.as_str())
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BOUNDARY)
    }

    /// Run every chunk through a fresh extractor.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Buffer`] if the recording overflows the
    /// default buffer ceiling.
    pub fn extract_frames(&self) -> Result<Vec<Frame>> {
        let mut extractor = FrameExtractor::new(DEFAULT_MAX_BUFFER_BYTES, self.boundary());
        let mut frames = Vec::new();
        for chunk in self.chunks.iter() {
            frames.extend(extractor.feed(&chunk.data)?);
        }
        Ok(frames)
    }

    /// Serve this capture as a stream transport
    pub fn into_transport(self, config: ReplayConfig) -> ReplayTransport {
        ReplayTransport {
            chunks: self.chunks,
            config,
            opens: AtomicUsize::new(0),
        }
    }
}

/// [`StreamTransport`] that answers every request with a recorded stream.
///
/// URL and token are ignored; the status is always 200.
#[derive(Debug)]
pub struct ReplayTransport {
    chunks: Arc<[RecordedChunk]>,
    config: ReplayConfig,
    opens: AtomicUsize,
}

impl ReplayTransport {
    /// Number of streams opened so far
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }
}

#[async_trait]
impl StreamTransport for ReplayTransport {
    async fn open(&self, url: &Url, _token: &str) -> std::result::Result<StreamResponse, TransportError> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "Replaying {} chunks for {} (speed {}x)",
            self.chunks.len(),
            url,
            self.config.speed
        );
        Ok(StreamResponse::new(
            200,
            paced_stream(Arc::clone(&self.chunks), self.config.clone()),
        ))
    }
}

struct Playback {
    chunks: Arc<[RecordedChunk]>,
    index: usize,
    pass_start: Instant,
}

/// Yield recorded chunks, sleeping to reproduce their original spacing
fn paced_stream(chunks: Arc<[RecordedChunk]>, config: ReplayConfig) -> ChunkStream {
    let playback = Playback {
        chunks,
        index: 0,
        pass_start: Instant::now(),
    };
    let paced = config.speed.is_finite() && config.speed > 0.0;

    futures::stream::unfold(playback, move |mut playback| {
        let config = config.clone();
        async move {
            if playback.index >= playback.chunks.len() {
                if !config.loop_playback || playback.chunks.is_empty() {
                    log::debug!("Replay completed");
                    return None;
                }
                log::debug!("Replay loop completed, restarting");
                playback.index = 0;
                playback.pass_start = Instant::now();
            }

            let chunk = playback.chunks.get(playback.index)?.clone();
            if paced {
                let offset = Duration::from_micros((chunk.timestamp_us as f64 / config.speed) as u64);
                tokio::time::sleep_until(playback.pass_start + offset).await;
            }

            playback.index += 1;
            Some((Ok(chunk.data), playback))
        }
    })
    .boxed()
}

/// Synchronous chunk replay for simple use cases.
///
/// Replays all chunks without timing and returns all extracted frames.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded or the recording
/// overflows the frame buffer.
pub fn replay_all_frames(path: &Path) -> Result<Vec<Frame>> {
    ChunkReplay::load(path)?.extract_frames()
}
