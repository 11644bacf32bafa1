use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared with the viewer without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Arrival time at the stream handle; drives pacing and rotation
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata, timestamp: Instant) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("size", &(self.meta.width, self.meta.height))
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, padding included
    pub stride: u32,
    pub format: PixelFormat,
    pub source_pts: Option<Duration>, // Presentation timestamp from the source, informational only
}

impl FrameMetadata {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            sequence: 0,
            width,
            height,
            stride: width * 3,
            format,
            source_pts: None,
        }
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Mjpeg,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
