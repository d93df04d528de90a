//! Revocable display handles for extracted frames
//!
//! The UI never touches frame bytes directly; it renders whatever a
//! [`DisplayHandle`]'s URL points at. Handles are single-owner and revoking
//! one consumes it, so a handle cannot be revoked twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::frame_extractor::Frame;

/// URL scheme prefix used by [`BlobStore`]
pub const BLOB_URL_PREFIX: &str = "blob:camstream/";

/// Opaque, revocable reference to a published frame
///
/// Deliberately not `Clone`: the publisher owns it until revoking it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DisplayHandle {
    url: String,
}

impl DisplayHandle {
    /// Wrap a presenter-specific URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// URL the UI renders from
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Turns frames into displayable resources.
pub trait FramePresenter: Send + Sync {
    /// Create a handle for `frame` under `camera_id`
    fn publish(&self, camera_id: &str, frame: &Frame) -> DisplayHandle;

    /// Release the resource behind `handle`
    fn revoke(&self, handle: DisplayHandle);
}

/// In-process presenter mapping `blob:` URLs to frame bytes
#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    next_id: AtomicU64,
    revoked: AtomicU64,
}

impl BlobStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes behind a live URL
    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.lock().get(url).cloned()
    }

    /// Number of handles published but not yet revoked
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Total handles ever published
    pub fn published_count(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Total handles revoked
    pub fn revoked_count(&self) -> u64 {
        self.revoked.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl FramePresenter for BlobStore {
    fn publish(&self, camera_id: &str, frame: &Frame) -> DisplayHandle {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let url = format!("{}{}/{}", BLOB_URL_PREFIX, camera_id, id);
        self.lock().insert(url.clone(), frame.bytes());
        DisplayHandle::new(url)
    }

    fn revoke(&self, handle: DisplayHandle) {
        if self.lock().remove(handle.url()).is_some() {
            self.revoked.fetch_add(1, Ordering::AcqRel);
        } else {
            log::warn!("Revoking unknown display handle {}", handle.url());
        }
    }
}
