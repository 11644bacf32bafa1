pub mod frame;
pub mod jpeg;
pub mod source;
pub mod test_pattern;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

use std::time::Duration;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{FrameSource, SourceConnector, StreamHandle, StreamInfo};
pub use test_pattern::{TestPatternParams, TestPatternSource};

use crate::error::ConnectError;

/// Picks a backend from the URL scheme
pub struct UrlConnector {
    #[cfg(feature = "gstreamer-pipeline")]
    gst: Option<gst_capture::GstConnector>,
}

impl UrlConnector {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "gstreamer-pipeline")]
            gst: match gst_capture::GstConnector::new() {
                Ok(connector) => Some(connector),
                Err(e) => {
                    tracing::warn!("GStreamer unavailable, only test:// sources will open: {}", e);
                    None
                }
            },
        }
    }
}

impl Default for UrlConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceConnector for UrlConnector {
    fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn FrameSource>, ConnectError> {
        if url.starts_with(test_pattern::SCHEME) {
            let params = TestPatternParams::parse(url)?;
            return Ok(Box::new(TestPatternSource::new(params)));
        }

        #[cfg(feature = "gstreamer-pipeline")]
        if let Some(gst) = &self.gst {
            if gst_capture::GstConnector::supports(url) {
                return gst.open(url, timeout);
            }
        }

        let _ = timeout;
        Err(ConnectError::UnsupportedUrl(url.to_string()))
    }
}
