//! `camstream` - Authenticated MJPEG camera stream client
//!
//! Pulls `multipart/x-mixed-replace` JPEG streams from the dashboard backend,
//! extracts complete frames by marker scanning, and keeps exactly one
//! revocable display handle per camera.
//!
//! ```text
//! CameraStreamController ─► AuthenticatedStreamSession ─► StreamTransport
//!          ▲                          │
//!          │ Frame                    ▼ chunks
//!    FramePresenter ◄──────── FrameExtractor ─► ByteAccumulator
//! ```

pub mod accumulator;
pub mod capture;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod display;
pub mod frame_extractor;
pub mod replay;
pub mod scanner;
pub mod session;
pub mod test_utils;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::watch;

pub use accumulator::{BufferError, ByteAccumulator};
pub use config::{CameraConfig, DashboardConfig, StreamConfig};
pub use controller::{CameraStatus, CameraStreamController, ControllerState};
pub use credentials::{CredentialProvider, StaticToken};
pub use display::{BlobStore, DisplayHandle, FramePresenter};
pub use frame_extractor::{Frame, FrameExtractor};
pub use session::{AuthenticatedStreamSession, SessionEnd, SessionState, StreamError};
pub use transport::{HttpTransport, StreamTransport};

/// Path of the [`DashboardConfig`] JSON file
pub const ENV_CONFIG: &str = "CAMSTREAM_CONFIG";
/// Bearer token for all cameras
pub const ENV_TOKEN: &str = "CAMSTREAM_TOKEN";
/// Directory receiving `<camera>.jpg` with each camera's latest frame
pub const ENV_SNAPSHOT_DIR: &str = "CAMSTREAM_SNAPSHOT_DIR";

/// Run the `camstream` service
///
/// Initializes logging, loads the dashboard config, starts a controller per
/// camera and streams until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded, the runtime or HTTP
/// client cannot be created, or the Ctrl-C handler cannot be installed.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("camstream starting up");

    let config_path = std::env::var_os(ENV_CONFIG)
        .map(PathBuf::from)
        .with_context(|| format!("{} is not set", ENV_CONFIG))?;
    let config = DashboardConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let token = std::env::var(ENV_TOKEN).unwrap_or_default();
    if token.is_empty() {
        log::warn!("{} is not set; streams will fail to authenticate", ENV_TOKEN);
    }
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticToken::new(token));
    let snapshot_dir = std::env::var_os(ENV_SNAPSHOT_DIR).map(PathBuf::from);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(serve(config, credentials, snapshot_dir))
}

async fn serve(
    config: DashboardConfig,
    credentials: Arc<dyn CredentialProvider>,
    snapshot_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let transport: Arc<dyn StreamTransport> = Arc::new(
        HttpTransport::new(config.stream.connect_timeout())
            .context("failed to build HTTP client")?,
    );
    let store = Arc::new(BlobStore::new());

    let mut controllers = Vec::with_capacity(config.cameras.len());
    for camera in config.cameras {
        let mut controller = CameraStreamController::new(
            camera.clone(),
            config.stream.clone(),
            Arc::clone(&credentials),
            Arc::clone(&transport),
            Arc::clone(&store) as Arc<dyn FramePresenter>,
        );
        tokio::spawn(watch_status(
            controller.subscribe(),
            Arc::clone(&store),
            snapshot_dir.clone(),
        ));
        controller.apply_config(camera);
        controllers.push(controller);
    }

    if !controllers.iter().any(|c| c.camera().enabled) {
        log::warn!("No enabled cameras in config");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    log::info!("Shutting down {} camera(s)", controllers.len());
    drop(controllers);
    Ok(())
}

/// Log state transitions and mirror the latest frame to disk
async fn watch_status(
    mut status_rx: watch::Receiver<CameraStatus>,
    store: Arc<BlobStore>,
    snapshot_dir: Option<PathBuf>,
) {
    let mut last_state = None;

    while status_rx.changed().await.is_ok() {
        let status = status_rx.borrow_and_update().clone();

        if last_state != Some(status.state) {
            match &status.error {
                Some(error) => log::warn!("[{}] {:?}: {}", status.camera_id, status.state, error),
                None => log::info!("[{}] {:?}", status.camera_id, status.state),
            }
            last_state = Some(status.state);
        }

        if let (Some(dir), Some(url)) = (&snapshot_dir, &status.frame_url) {
            if let Some(jpeg) = store.get(url) {
                // Frames published while this write runs are coalesced by the channel
                write_snapshot(snapshot_path(dir, &status.camera_id), jpeg).await;
            }
        }
    }
}

fn snapshot_path(dir: &Path, camera_id: &str) -> PathBuf {
    let name: String = camera_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{}.jpg", name))
}

/// Write `jpeg` on the blocking pool so the stream tasks keep running
async fn write_snapshot(path: PathBuf, jpeg: Bytes) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::write(&path, &jpeg).map_err(|e| format!("{}: {}", path.display(), e))
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to write snapshot {}", e),
        Err(e) => log::warn!("Snapshot writer stopped: {}", e),
    }
}
