//! Per-camera stream controller
//!
//! Owns at most one [`AuthenticatedStreamSession`] at a time and turns its
//! frames into [`DisplayHandle`]s. Observable state is published through a
//! `tokio::sync::watch` channel as [`CameraStatus`].
//!
//! Every session runs on its own tokio task tagged with a generation number.
//! Stopping bumps the generation under the state lock, so a worker that is
//! still winding down can never install a handle or an error afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::ChunkRecorder;
use crate::config::{CameraConfig, StreamConfig};
use crate::credentials::CredentialProvider;
use crate::display::{DisplayHandle, FramePresenter};
use crate::frame_extractor::Frame;
use crate::session::{AuthenticatedStreamSession, SessionEnd, SessionHandle, StreamError};
use crate::transport::StreamTransport;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// No session
    Disabled,
    /// Session running, no frame yet
    Starting,
    /// At least one frame displayed
    Live,
    /// Session failed; see [`CameraStatus::error`]
    Errored,
}

/// Snapshot of a camera's observable state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    /// Camera identifier
    pub camera_id: String,
    /// Lifecycle state
    pub state: ControllerState,
    /// Whether streaming is requested
    pub enabled: bool,
    /// URL of the current display handle
    pub frame_url: Option<String>,
    /// Failure reason while `Errored`
    pub error: Option<String>,
    /// True while waiting for the first frame
    pub loading: bool,
    /// Frames received by the current session
    pub frames_received: u64,
}

impl CameraStatus {
    fn disabled(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            state: ControllerState::Disabled,
            enabled: false,
            frame_url: None,
            error: None,
            loading: false,
            frames_received: 0,
        }
    }
}

struct Inner {
    camera_id: String,
    generation: u64,
    state: ControllerState,
    enabled: bool,
    current: Option<DisplayHandle>,
    error: Option<String>,
    frames_received: u64,
}

impl Inner {
    fn status(&self) -> CameraStatus {
        CameraStatus {
            camera_id: self.camera_id.clone(),
            state: self.state,
            enabled: self.enabled,
            frame_url: self.current.as_ref().map(|h| h.url().to_string()),
            error: self.error.clone(),
            loading: self.state == ControllerState::Starting,
            frames_received: self.frames_received,
        }
    }
}

/// State shared between the controller and its worker task
struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<CameraStatus>,
    presenter: Arc<dyn FramePresenter>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, inner: &Inner) {
        let status = inner.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Retire the current generation and its handle
    fn reset(&self, camera_id: &str, state: ControllerState, error: Option<String>) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(handle) = inner.current.take() {
            self.presenter.revoke(handle);
        }
        inner.camera_id = camera_id.to_string();
        inner.state = state;
        inner.enabled = state == ControllerState::Errored;
        inner.error = error;
        inner.frames_received = 0;
        self.notify(&inner);
    }

    /// Enter `Starting` and return the new generation
    fn begin(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = ControllerState::Starting;
        inner.enabled = true;
        inner.error = None;
        inner.frames_received = 0;
        self.notify(&inner);
        inner.generation
    }

    fn on_frame(&self, generation: u64, frame: &Frame) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        let handle = self.presenter.publish(&inner.camera_id, frame);
        let previous = inner.current.replace(handle);
        if let Some(previous) = previous {
            self.presenter.revoke(previous);
        }

        inner.frames_received += 1;
        if inner.state != ControllerState::Live {
            log::info!(
                "[{}] Live ({} bytes first frame)",
                inner.camera_id,
                frame.len()
            );
            inner.state = ControllerState::Live;
        } else {
            log::debug!(
                "[{}] Frame #{} ({} bytes)",
                inner.camera_id,
                frame.sequence(),
                frame.len()
            );
        }
        self.notify(&inner);
    }

    fn on_session_end(&self, generation: u64, result: Result<SessionEnd, StreamError>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        if let Some(handle) = inner.current.take() {
            self.presenter.revoke(handle);
        }
        inner.generation += 1;

        match result {
            Ok(end) => {
                log::info!("[{}] Stream ended ({:?}), disabling", inner.camera_id, end);
                inner.state = ControllerState::Disabled;
                inner.enabled = false;
                inner.error = None;
            }
            Err(e) => {
                inner.state = ControllerState::Errored;
                inner.error = Some(e.to_string());
            }
        }
        self.notify(&inner);
    }
}

struct Worker {
    session: SessionHandle,
    task: JoinHandle<()>,
}

/// Drives one camera's stream and its current display handle
///
/// Must be used from within a tokio runtime; `set_enabled(true)` spawns the
/// session task.
pub struct CameraStreamController {
    camera: CameraConfig,
    stream_config: StreamConfig,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn StreamTransport>,
    recorder: Option<Arc<ChunkRecorder>>,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl CameraStreamController {
    /// Create a disabled controller.
    ///
    /// `camera.enabled` is not acted upon; call [`apply_config`](Self::apply_config)
    /// or [`set_enabled`](Self::set_enabled) to start streaming.
    pub fn new(
        camera: CameraConfig,
        stream_config: StreamConfig,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn StreamTransport>,
        presenter: Arc<dyn FramePresenter>,
    ) -> Self {
        let (status_tx, _) = watch::channel(CameraStatus::disabled(&camera.id));
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                camera_id: camera.id.clone(),
                generation: 0,
                state: ControllerState::Disabled,
                enabled: false,
                current: None,
                error: None,
                frames_received: 0,
            }),
            status_tx,
            presenter,
        });

        Self {
            camera,
            stream_config,
            credentials,
            transport,
            recorder: None,
            shared,
            worker: None,
        }
    }

    /// Attach a chunk recorder to every session this controller starts
    pub fn with_recorder(mut self, recorder: Arc<ChunkRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Camera currently configured
    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Current status snapshot
    pub fn status(&self) -> CameraStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ControllerState {
        self.shared.lock().state
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<CameraStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Whether a session is attached and not yet finished
    pub fn has_active_session(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }

    /// Start or stop streaming.
    ///
    /// Enabling while `Starting` or `Live` does nothing. Enabling from
    /// `Disabled` or `Errored` starts a fresh session. Disabling is safe
    /// from any state.
    ///
    /// # Panics
    ///
    /// Starting a session panics outside a tokio runtime.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.stop();
            return;
        }

        match self.state() {
            ControllerState::Starting | ControllerState::Live => {}
            ControllerState::Disabled | ControllerState::Errored => self.start(),
        }
    }

    /// Switch to a new camera config.
    ///
    /// A change of id or base URL always closes the old session before the
    /// new one starts. The new `enabled` flag is then applied.
    ///
    /// # Panics
    ///
    /// Same as [`set_enabled`](Self::set_enabled).
    pub fn apply_config(&mut self, camera: CameraConfig) {
        if !self.camera.same_stream(&camera) {
            log::info!(
                "[{}] Reconfigured to {} at {}",
                self.camera.id,
                camera.id,
                camera.base_url
            );
            self.stop();
            self.camera = camera;
            self.shared
                .reset(&self.camera.id, ControllerState::Disabled, None);
        } else {
            self.camera = camera;
        }
        self.set_enabled(self.camera.enabled);
    }

    fn start(&mut self) {
        self.stop();

        let url = match self.camera.stream_url() {
            Ok(url) => url,
            Err(e) => {
                log::error!("[{}] {}", self.camera.id, e);
                self.shared
                    .reset(&self.camera.id, ControllerState::Errored, Some(e.to_string()));
                return;
            }
        };

        let mut session = AuthenticatedStreamSession::new(
            self.camera.id.clone(),
            url,
            Arc::clone(&self.credentials),
            Arc::clone(&self.transport),
            &self.stream_config,
        );
        if let Some(recorder) = &self.recorder {
            session = session.with_recorder(Arc::clone(recorder));
        }
        let handle = session.handle();

        log::info!("[{}] Starting stream", self.camera.id);
        let generation = self.shared.begin();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let result = session
                .run(|frame| shared.on_frame(generation, &frame))
                .await;
            shared.on_session_end(generation, result);
        });

        self.worker = Some(Worker {
            session: handle,
            task,
        });
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            log::info!("[{}] Stopping stream", self.camera.id);
            worker.session.close();
            worker.task.abort();
        }
        self.shared
            .reset(&self.camera.id, ControllerState::Disabled, None);
    }
}

impl Drop for CameraStreamController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CameraStreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraStreamController")
            .field("camera", &self.camera)
            .field("state", &self.state())
            .field("has_active_session", &self.has_active_session())
            .finish_non_exhaustive()
    }
}
