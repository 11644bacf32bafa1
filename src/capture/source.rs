//! Camera stream abstraction and the handle the supervisor drives

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::capture::frame::Frame;
use crate::error::{ConnectError, StreamError};

/// Properties a source reports about its stream once opened
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamInfo {
    pub frame_rate: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// An open camera stream provided by a media backend.
///
/// Implementations block in `read` for at most `timeout` and return
/// [`StreamError::Timeout`] when no frame arrived in that window.
pub trait FrameSource: Send {
    fn read(&mut self, timeout: Duration) -> Result<Frame, StreamError>;

    fn info(&self) -> StreamInfo;

    fn close(&mut self);
}

/// Opens [`FrameSource`]s for camera URLs.
pub trait SourceConnector: Send + Sync {
    fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn FrameSource>, ConnectError>;
}

impl<T: SourceConnector + ?Sized> SourceConnector for Arc<T> {
    fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn FrameSource>, ConnectError> {
        (**self).open(url, timeout)
    }
}

/// One connection to one camera. No retry policy lives here: every failure is
/// returned to the caller as-is.
pub struct StreamHandle {
    camera: String,
    source: Option<Box<dyn FrameSource>>,
    info: StreamInfo,
    sequence: u64,
}

impl StreamHandle {
    #[instrument(skip(connector, timeout))]
    pub fn open(
        connector: &dyn SourceConnector,
        camera: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let source = connector.open(url, timeout)?;
        let info = source.info();
        info!(?info, "Stream opened");

        Ok(Self {
            camera: camera.to_string(),
            source: Some(source),
            info,
            sequence: 0,
        })
    }

    /// Read the next frame, stamping it with its arrival time.
    pub fn read(&mut self, timeout: Duration) -> Result<Frame, StreamError> {
        let source = self.source.as_mut().ok_or(StreamError::Closed)?;
        let mut frame = source.read(timeout)?;

        self.sequence += 1;
        frame.timestamp = Instant::now();
        Arc::make_mut(&mut frame.meta).sequence = self.sequence;

        Ok(frame)
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
            debug!(camera = %self.camera, frames = self.sequence, "Stream closed");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
