//! Authenticated camera stream session
//!
//! One session is one HTTP connection to `{base}/cameras/{id}/stream`:
//!
//! ```text
//! Idle → Authenticating → Streaming → Closed
//!              │   ▲           │
//!              ▼   │ (401)     └──────→ Failed
//!            Retrying ─────────────────→ Failed (second 401)
//! ```
//!
//! Cancellation is checked at every suspension point (token acquisition,
//! request issuance, each chunk read). A cancelled session drops the response
//! body, which aborts the transfer, and never reports an error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accumulator::BufferError;
use crate::capture::ChunkRecorder;
use crate::config::StreamConfig;
use crate::credentials::CredentialProvider;
use crate::frame_extractor::{Frame, FrameExtractor};
use crate::transport::{ChunkStream, StreamTransport, TransportError};

/// Re-requests allowed after an unauthorized response
pub const MAX_AUTH_RETRIES: u32 = 1;

/// HTTP status that triggers a token refresh
const UNAUTHORIZED: u16 = 401;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Fetching a token / waiting for the first response
    Authenticating,
    /// Response accepted, chunks flowing
    Streaming,
    /// First request was unauthorized; retrying with a fresh token
    Retrying,
    /// Ended by EOF or cancellation
    Closed,
    /// Ended by an error
    Failed,
}

impl SessionState {
    /// Whether the session can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The credential provider had no token.
    #[error("cannot authenticate: no credential available")]
    NoCredential,

    /// The backend rejected the token twice.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The backend answered with a non-success status other than 401.
    #[error("stream start failed with HTTP status {status}")]
    StreamStartFailed {
        /// HTTP status code.
        status: u16,
    },

    /// Frame buffering failed, normally a runaway stream with no frames.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Network failure while connecting or reading.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No data arrived within the idle timeout.
    #[error("stream stalled: no data for {idle:?}")]
    Stalled {
        /// Configured idle timeout.
        idle: Duration,
    },
}

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the body
    EndOfStream,
    /// [`SessionHandle::close`] was called
    Cancelled,
}

/// Cloneable control handle for a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(SessionState::Idle)),
        }
    }

    /// Abort the transfer and mark the session closed.
    ///
    /// Idempotent. A failed session stays `Failed`.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut state = self.lock();
        if !state.is_terminal() {
            log::debug!("Session closed from {:?}", *state);
            *state = SessionState::Closed;
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.lock()
    }

    /// Whether `close` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One authenticated streaming connection for a single camera
pub struct AuthenticatedStreamSession {
    /// Camera this session streams, for logging
    camera_id: String,
    /// Stream endpoint
    url: Url,
    /// Bearer token source
    credentials: Arc<dyn CredentialProvider>,
    /// HTTP layer
    transport: Arc<dyn StreamTransport>,
    /// Turns body chunks into frames
    extractor: FrameExtractor,
    /// Maximum wait between chunks
    idle_timeout: Option<Duration>,
    /// Shared cancellation and state
    handle: SessionHandle,
    /// Optional raw chunk capture
    recorder: Option<Arc<ChunkRecorder>>,
    /// Stream requests sent so far
    requests_issued: u32,
}

impl AuthenticatedStreamSession {
    /// Create an idle session
    pub fn new(
        camera_id: impl Into<String>,
        url: Url,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn StreamTransport>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            url,
            credentials,
            transport,
            extractor: FrameExtractor::new(config.max_buffer_bytes, &config.boundary),
            idle_timeout: config.idle_timeout(),
            handle: SessionHandle::new(),
            recorder: None,
            requests_issued: 0,
        }
    }

    /// Record every received chunk into `recorder`
    pub fn with_recorder(mut self, recorder: Arc<ChunkRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Control handle that stays valid while `run` holds `&mut self`
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Abort the session. Same as [`SessionHandle::close`].
    pub fn close(&self) {
        self.handle.close();
    }

    /// Number of stream requests sent (1, or 2 after a 401)
    pub fn requests_issued(&self) -> u32 {
        self.requests_issued
    }

    /// Authenticate and open the stream.
    ///
    /// Returns `Ok(None)` if the session was cancelled first.
    ///
    /// # Errors
    ///
    /// - [`StreamError::NoCredential`] if no token is available
    /// - [`StreamError::AuthenticationFailed`] if the retried request is also unauthorized
    /// - [`StreamError::StreamStartFailed`] for any other non-success status
    /// - [`StreamError::Transport`] if no response could be obtained
    pub async fn open(&mut self) -> Result<Option<ChunkStream>, StreamError> {
        let cancel = self.handle.cancel.clone();
        self.handle.set_state(SessionState::Authenticating);
        let mut retries = 0;

        loop {
            let token = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                token = self.credentials.get_valid_token() => token,
            };
            let token = token.ok_or(StreamError::NoCredential)?;

            self.requests_issued += 1;
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                response = self.transport.open(&self.url, &token) => response?,
            };

            match response.status {
                _ if response.is_success() => {
                    self.handle.set_state(SessionState::Streaming);
                    log::info!(
                        "[{}] Stream open (HTTP {})",
                        self.camera_id,
                        response.status
                    );
                    return Ok(Some(response.body));
                }
                UNAUTHORIZED if retries < MAX_AUTH_RETRIES => {
                    retries += 1;
                    log::warn!(
                        "[{}] Stream request unauthorized - retrying with a fresh token",
                        self.camera_id
                    );
                    self.handle.set_state(SessionState::Retrying);
                }
                UNAUTHORIZED => return Err(StreamError::AuthenticationFailed),
                status => return Err(StreamError::StreamStartFailed { status }),
            }
        }
    }

    /// Open the stream and deliver frames to `on_frame` until it ends.
    ///
    /// Frames are delivered in stream order. The session ends `Closed` on EOF
    /// or cancellation and `Failed` on error.
    ///
    /// # Errors
    ///
    /// Any [`StreamError`] except for sessions that were cancelled, which
    /// always return `Ok(SessionEnd::Cancelled)`.
    pub async fn run<F>(&mut self, mut on_frame: F) -> Result<SessionEnd, StreamError>
    where
        F: FnMut(Frame) + Send,
    {
        let result = match self.stream_frames(&mut on_frame).await {
            Err(_) if self.handle.is_cancelled() => Ok(SessionEnd::Cancelled),
            other => other,
        };

        match &result {
            Ok(end) => {
                log::info!("[{}] Stream closed ({:?})", self.camera_id, end);
                self.handle.set_state(SessionState::Closed);
            }
            Err(e) => {
                log::error!("[{}] Stream failed: {}", self.camera_id, e);
                self.handle.set_state(SessionState::Failed);
            }
        }
        result
    }

    async fn stream_frames<F>(&mut self, on_frame: &mut F) -> Result<SessionEnd, StreamError>
    where
        F: FnMut(Frame) + Send,
    {
        let Some(mut body) = self.open().await? else {
            return Ok(SessionEnd::Cancelled);
        };
        let cancel = self.handle.cancel.clone();

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                chunk = next_chunk(&mut body, self.idle_timeout) => chunk?,
            };
            let Some(chunk) = chunk else {
                return Ok(SessionEnd::EndOfStream);
            };

            if let Some(recorder) = &self.recorder {
                recorder.record_chunk(&chunk);
            }

            for frame in self.extractor.feed(&chunk)? {
                if cancel.is_cancelled() {
                    return Ok(SessionEnd::Cancelled);
                }
                if let Some(recorder) = &self.recorder {
                    recorder.record_frame();
                }
                on_frame(frame);
            }
        }
    }
}

impl std::fmt::Debug for AuthenticatedStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedStreamSession")
            .field("camera_id", &self.camera_id)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .field("requests_issued", &self.requests_issued)
            .finish_non_exhaustive()
    }
}

/// Next body chunk, bounded by the idle timeout
async fn next_chunk(
    body: &mut ChunkStream,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, StreamError> {
    let item = match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, body.next())
            .await
            .map_err(|_| StreamError::Stalled { idle })?,
        None => body.next().await,
    };
    Ok(item.transpose()?)
}
