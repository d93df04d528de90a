//! Integration tests for the per-camera controller.
//!
//! Drives `CameraStreamController` against scripted transports and an
//! in-process `BlobStore`, checking state transitions and that display
//! handles and response bodies are always released.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use camstream_lib::config::{CameraConfig, StreamConfig};
use camstream_lib::controller::{CameraStatus, CameraStreamController, ControllerState};
use camstream_lib::display::BlobStore;
use camstream_lib::test_utils::{
    BodyEnd, MjpegStreamGenerator, ScriptedCredentials, ScriptedResponse, ScriptedTransport,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    controller: CameraStreamController,
    status: watch::Receiver<CameraStatus>,
    store: Arc<BlobStore>,
    transport: Arc<ScriptedTransport>,
    credentials: Arc<ScriptedCredentials>,
}

fn harness(
    responses: impl IntoIterator<Item = ScriptedResponse>,
    credentials: ScriptedCredentials,
) -> Harness {
    let store = Arc::new(BlobStore::new());
    let transport = Arc::new(ScriptedTransport::new(responses));
    let credentials = Arc::new(credentials);
    let controller = CameraStreamController::new(
        CameraConfig::new("porch", "http://cam.local/api", false),
        StreamConfig::default(),
        credentials.clone(),
        transport.clone(),
        store.clone(),
    );
    let status = controller.subscribe();

    Harness {
        controller,
        status,
        store,
        transport,
        credentials,
    }
}

/// Wait until the published status satisfies `pred`
async fn wait_for_status(
    status: &mut watch::Receiver<CameraStatus>,
    pred: impl FnMut(&CameraStatus) -> bool,
) -> CameraStatus {
    tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("timed out waiting for status")
        .expect("controller dropped")
        .clone()
}

/// Yield to the runtime until `cond` holds
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

fn frames_body(gen: &mut MjpegStreamGenerator, n: usize, end: BodyEnd) -> (ScriptedResponse, Vec<Vec<u8>>) {
    let (bytes, images) = gen.stream(n);
    (ScriptedResponse::ok(gen.chunk(&bytes), end), images)
}

// ============================================================================
// Enable / Disable
// ============================================================================

#[tokio::test]
async fn test_enable_goes_live_on_first_frame() {
    let mut gen = MjpegStreamGenerator::new(64);
    let (body, images) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    let starting = h.controller.status();
    assert_eq!(starting.state, ControllerState::Starting);
    assert!(starting.enabled && starting.loading);

    let live = wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;
    assert!(!live.loading);
    assert_eq!(live.frames_received, 1);
    let url = live.frame_url.expect("live status has a frame");
    assert_eq!(h.store.get(&url).unwrap().as_ref(), &images[0][..]);

    assert_eq!(h.transport.tokens(), vec!["tok".to_string()]);
    assert_eq!(
        h.transport.urls()[0].as_str(),
        "http://cam.local/api/cameras/porch/stream"
    );
}

#[tokio::test]
async fn test_disable_before_first_frame_leaves_nothing_open() {
    let mut h = harness(
        [ScriptedResponse::ok(vec![], BodyEnd::Hang)],
        ScriptedCredentials::always("tok"),
    );

    h.controller.set_enabled(true);
    h.controller.set_enabled(false);

    let status = h.controller.status();
    assert_eq!(status.state, ControllerState::Disabled);
    assert!(!status.enabled && !status.loading);
    assert!(status.frame_url.is_none() && status.error.is_none());
    assert!(!h.controller.has_active_session());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.transport.open_bodies(), 0);
    assert_eq!(h.store.live_count(), 0);
    assert_eq!(h.store.published_count(), 0);
}

#[tokio::test]
async fn test_disable_while_request_pending_surfaces_no_error() {
    let mut h = harness(
        [ScriptedResponse::Unanswered],
        ScriptedCredentials::always("tok"),
    );

    h.controller.set_enabled(true);
    let transport = h.transport.clone();
    eventually(|| transport.in_flight() == 1).await;
    assert_eq!(h.controller.state(), ControllerState::Starting);

    h.controller.set_enabled(false);

    eventually(|| transport.in_flight() == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = h.controller.status();
    assert_eq!(status.state, ControllerState::Disabled);
    assert!(status.error.is_none());
    assert_eq!(h.transport.request_count(), 1);
    assert_eq!(h.store.published_count(), 0);
}

#[tokio::test]
async fn test_disable_while_live_releases_everything() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 3, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.frames_received == 3).await;
    assert_eq!(h.transport.open_bodies(), 1);

    h.controller.set_enabled(false);

    let status = h.controller.status();
    assert_eq!(status.state, ControllerState::Disabled);
    assert!(status.frame_url.is_none());
    assert_eq!(h.store.live_count(), 0);
    assert_eq!(h.store.revoked_count(), 3);

    let transport = Arc::clone(&h.transport);
    eventually(|| transport.open_bodies() == 0).await;
}

#[tokio::test]
async fn test_enable_while_live_is_noop() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;

    h.controller.set_enabled(true);
    h.controller.set_enabled(true);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.controller.state(), ControllerState::Live);
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_drop_tears_down() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 2, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.frames_received == 2).await;

    let Harness {
        controller,
        store,
        transport,
        ..
    } = h;
    drop(controller);

    assert_eq!(store.live_count(), 0);
    eventually(|| transport.open_bodies() == 0).await;
}

#[tokio::test]
async fn test_end_of_stream_disables_without_error() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 2, BodyEnd::Eof);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.frames_received == 2).await;
    let status = wait_for_status(&mut h.status, |s| s.state == ControllerState::Disabled).await;

    assert!(status.error.is_none());
    assert!(status.frame_url.is_none());
    assert!(!status.enabled);
    assert_eq!(h.store.live_count(), 0);
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_unauthorized_then_retry_goes_live() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, images) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness(
        [ScriptedResponse::Status(401), body],
        ScriptedCredentials::sequence([Some("expired"), Some("fresh")]),
    );

    h.controller.set_enabled(true);
    let live = wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;

    let url = live.frame_url.unwrap();
    assert_eq!(h.store.get(&url).unwrap().as_ref(), &images[0][..]);
    assert_eq!(
        h.transport.tokens(),
        vec!["expired".to_string(), "fresh".to_string()]
    );
    assert_eq!(h.credentials.calls(), 2);
}

#[tokio::test]
async fn test_second_unauthorized_errors_after_one_retry() {
    let mut h = harness(
        [
            ScriptedResponse::Status(401),
            ScriptedResponse::Status(401),
            ScriptedResponse::Status(401),
        ],
        ScriptedCredentials::always("tok"),
    );

    h.controller.set_enabled(true);
    let status = wait_for_status(&mut h.status, |s| s.state == ControllerState::Errored).await;

    assert_eq!(status.error.as_deref(), Some("authentication failed"));
    assert!(status.enabled && !status.loading);
    assert_eq!(h.transport.request_count(), 2);
    assert_eq!(h.credentials.calls(), 2);
}

#[tokio::test]
async fn test_missing_credential_errors_without_request() {
    let mut h = harness([], ScriptedCredentials::sequence([None]));

    h.controller.set_enabled(true);
    let status = wait_for_status(&mut h.status, |s| s.state == ControllerState::Errored).await;

    assert!(status.error.unwrap().contains("cannot authenticate"));
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_server_error_surfaces_status() {
    let mut h = harness(
        [ScriptedResponse::Status(503)],
        ScriptedCredentials::always("tok"),
    );

    h.controller.set_enabled(true);
    let status = wait_for_status(&mut h.status, |s| s.state == ControllerState::Errored).await;

    assert!(status.error.unwrap().contains("503"));
}

// ============================================================================
// Display Handle Ownership
// ============================================================================

#[tokio::test]
async fn test_each_frame_replaces_previous_handle() {
    let (tx, body) = ScriptedResponse::live();
    let mut h = harness([body], ScriptedCredentials::always("tok"));
    let mut gen = MjpegStreamGenerator::default();

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.state == ControllerState::Starting).await;

    let mut previous_url: Option<String> = None;
    for n in 1..=5u64 {
        let jpeg = gen.jpeg();
        tx.unbounded_send(Bytes::from(gen.part(&jpeg))).unwrap();

        let status = wait_for_status(&mut h.status, |s| s.frames_received == n).await;
        let url = status.frame_url.expect("live status always has a handle");

        assert_eq!(status.state, ControllerState::Live);
        assert_eq!(h.store.get(&url).unwrap().as_ref(), &jpeg[..]);
        assert_eq!(h.store.live_count(), 1);
        assert_eq!(h.store.revoked_count(), n - 1);
        if let Some(previous) = previous_url.replace(url) {
            assert!(h.store.get(&previous).is_none());
        }
    }
}

#[tokio::test]
async fn test_live_status_never_lacks_a_handle() {
    let mut gen = MjpegStreamGenerator::new(5);
    let (body, _) = frames_body(&mut gen, 20, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| {
        if s.state == ControllerState::Live {
            assert!(s.frame_url.is_some());
        }
        s.frames_received == 20
    })
    .await;
    assert!(h.store.live_count() <= 1);
}

#[tokio::test]
async fn test_stream_failure_revokes_handle() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 2, BodyEnd::Fail("connection reset".to_string()));
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    h.controller.set_enabled(true);
    let status = wait_for_status(&mut h.status, |s| s.state == ControllerState::Errored).await;

    assert!(status.error.unwrap().contains("connection reset"));
    assert!(status.frame_url.is_none());
    assert_eq!(h.store.live_count(), 0);
    assert_eq!(h.store.published_count(), h.store.revoked_count());
}

#[tokio::test]
async fn test_runaway_stream_errors_with_overflow() {
    let store = Arc::new(BlobStore::new());
    let transport = Arc::new(ScriptedTransport::new([ScriptedResponse::ok(
        vec![Bytes::from(vec![0u8; 512]); 8],
        BodyEnd::Hang,
    )]));
    let mut controller = CameraStreamController::new(
        CameraConfig::new("porch", "http://cam.local", false),
        StreamConfig {
            max_buffer_bytes: 2048,
            ..StreamConfig::default()
        },
        Arc::new(ScriptedCredentials::always("tok")),
        transport.clone(),
        store,
    );
    let mut status = controller.subscribe();

    controller.set_enabled(true);
    let errored = wait_for_status(&mut status, |s| s.state == ControllerState::Errored).await;

    assert!(errored.error.unwrap().contains("overflow"));
    eventually(|| transport.open_bodies() == 0).await;
}

// ============================================================================
// Recovery and Reconfiguration
// ============================================================================

#[tokio::test]
async fn test_reenable_after_error_starts_new_session() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness(
        [ScriptedResponse::Status(500), body],
        ScriptedCredentials::always("tok"),
    );

    h.controller.set_enabled(true);
    wait_for_status(&mut h.status, |s| s.state == ControllerState::Errored).await;

    h.controller.set_enabled(true);
    let live = wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;

    assert!(live.error.is_none());
    assert_eq!(h.transport.request_count(), 2);
}

#[tokio::test]
async fn test_apply_config_switches_camera() {
    let mut gen = MjpegStreamGenerator::default();
    let (first, _) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let (second, images) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness([first, second], ScriptedCredentials::always("tok"));

    h.controller
        .apply_config(CameraConfig::new("porch", "http://cam.local/api", true));
    wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;

    h.controller
        .apply_config(CameraConfig::new("garage", "http://cam.local/api", true));
    let live = wait_for_status(&mut h.status, |s| {
        s.camera_id == "garage" && s.state == ControllerState::Live
    })
    .await;

    let url = live.frame_url.unwrap();
    assert!(url.contains("garage"));
    assert_eq!(h.store.get(&url).unwrap().as_ref(), &images[0][..]);
    assert_eq!(h.store.live_count(), 1);
    assert_eq!(
        h.transport.urls()[1].as_str(),
        "http://cam.local/api/cameras/garage/stream"
    );

    let transport = Arc::clone(&h.transport);
    eventually(|| transport.open_bodies() == 1).await;
}

#[tokio::test]
async fn test_apply_config_same_stream_keeps_session() {
    let mut gen = MjpegStreamGenerator::default();
    let (body, _) = frames_body(&mut gen, 1, BodyEnd::Hang);
    let mut h = harness([body], ScriptedCredentials::always("tok"));

    let camera = CameraConfig::new("porch", "http://cam.local/api", true);
    h.controller.apply_config(camera.clone());
    wait_for_status(&mut h.status, |s| s.state == ControllerState::Live).await;

    h.controller.apply_config(camera.clone());
    assert_eq!(h.controller.state(), ControllerState::Live);
    assert_eq!(h.transport.request_count(), 1);

    h.controller.apply_config(CameraConfig {
        enabled: false,
        ..camera
    });
    assert_eq!(h.controller.state(), ControllerState::Disabled);
    assert_eq!(h.store.live_count(), 0);
}
