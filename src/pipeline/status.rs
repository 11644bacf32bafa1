//! Per-camera status published for the viewer.
//!
//! Every entry has exactly one writer, the camera's own pipeline thread.
//! Readers load an immutable snapshot without locking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Never connected yet
    Disconnected,
    Connected,
    /// No usable frame within the staleness window
    Stale,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub state: ConnectionState,
    pub recording: bool,
    pub current_chunk: Option<String>,
    pub reconnects: u64,
}

impl Default for CameraStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            recording: false,
            current_chunk: None,
            reconnects: 0,
        }
    }
}

pub struct StatusEntry {
    camera: String,
    snapshot: ArcSwap<CameraStatus>,
    frames: AtomicU64,
}

impl StatusEntry {
    pub fn new(camera: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            snapshot: ArcSwap::from_pointee(CameraStatus::default()),
            frames: AtomicU64::new(0),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn load(&self) -> Arc<CameraStatus> {
        self.snapshot.load_full()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.load().state
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut CameraStatus)) {
        let mut next = CameraStatus::clone(&self.snapshot.load());
        f(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        if self.state() != state {
            self.update(|s| s.state = state);
        }
    }

    pub(crate) fn count_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only view over every camera's status
#[derive(Clone)]
pub struct StatusBoard {
    entries: Arc<[Arc<StatusEntry>]>,
}

impl StatusBoard {
    pub fn new(entries: Vec<Arc<StatusEntry>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn get(&self, camera: &str) -> Option<Arc<CameraStatus>> {
        self.entries
            .iter()
            .find(|e| e.camera() == camera)
            .map(|e| e.load())
    }

    pub fn state(&self, camera: &str) -> Option<ConnectionState> {
        self.get(camera).map(|s| s.state)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries.iter().map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
