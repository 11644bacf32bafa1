//! GStreamer-based network camera ingest (RTSP, HTTP, files)

use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameSource, SourceConnector, StreamInfo};
use crate::error::{ConnectError, StreamError};

/// Opens GStreamer pipelines for `rtsp://`, `http(s)://` and `file://` URLs
pub struct GstConnector;

impl GstConnector {
    pub fn new() -> Result<Self, ConnectError> {
        gst::init().map_err(|e| ConnectError::Open {
            url: String::new(),
            reason: format!("Failed to initialize GStreamer: {}", e),
        })?;
        Ok(Self)
    }

    pub fn supports(url: &str) -> bool {
        ["rtsp://", "rtsps://", "http://", "https://", "file://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
    }

    /// Build the decode pipeline string for a URL
    fn build_pipeline_string(url: &str) -> String {
        let tail = "videoconvert ! \
                    video/x-raw,format=RGB ! \
                    appsink name=appsink max-buffers=3 drop=true sync=false";

        if url.starts_with("rtsp") {
            // TCP interleaving survives lossy links far better than UDP
            format!(
                "rtspsrc location={} protocols=tcp latency=200 ! \
                 decodebin ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                 {}",
                url, tail
            )
        } else {
            format!("uridecodebin uri={} ! {}", url, tail)
        }
    }
}

impl SourceConnector for GstConnector {
    fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn FrameSource>, ConnectError> {
        let open_err = |reason: String| ConnectError::Open {
            url: url.to_string(),
            reason,
        };

        let pipeline_str = Self::build_pipeline_string(url);
        debug!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_err("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("Failed to cast to AppSink".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(format!("Failed to start pipeline: {:?}", e)))?;

        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (state_change, _, _) = pipeline.state(Some(wait));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::Async) => {
                info!("Pipeline started for {}", url);
            }
            Ok(gst::StateChangeSuccess::NoPreroll) => {
                // Live sources never preroll
                debug!("Live pipeline started for {}", url);
            }
            Err(_) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(ConnectError::Timeout(url.to_string()));
            }
        }

        Ok(Box::new(GstCapture {
            pipeline,
            appsink,
            info: StreamInfo::default(),
            closed: false,
        }))
    }
}

/// A running decode pipeline delivering RGB frames
pub struct GstCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    info: StreamInfo,
    closed: bool,
}

impl GstCapture {
    /// Surface the first pending pipeline error, if any
    fn pending_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }
}

impl FrameSource for GstCapture {
    fn read(&mut self, timeout: Duration) -> Result<Frame, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(wait) else {
            if let Some(err) = self.pending_error() {
                return Err(StreamError::Failed(err));
            }
            if self.appsink.is_eos() {
                return Err(StreamError::EndOfStream);
            }
            return Err(StreamError::Timeout);
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| StreamError::Failed("Sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| StreamError::Failed("Failed to map buffer".into()))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let caps = sample
            .caps()
            .ok_or_else(|| StreamError::Failed("Sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| StreamError::Failed("Failed to parse video info from caps".into()))?;

        let fps = video_info.fps();
        if fps.denom() > 0 && fps.numer() > 0 {
            self.info.frame_rate = Some(fps.numer() as f64 / fps.denom() as f64);
        } else if self.info.frame_rate.is_none() {
            warn!("Source reports no frame rate");
        }
        self.info.width = Some(video_info.width());
        self.info.height = Some(video_info.height());

        let mut meta = FrameMetadata::new(video_info.width(), video_info.height(), PixelFormat::Rgb24);
        meta.stride = video_info.stride()[0] as u32;
        meta.source_pts = buffer.pts().map(|pts| pts.into());

        Ok(Frame::new(data, meta, Instant::now()))
    }

    fn info(&self) -> StreamInfo {
        self.info
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.close();
    }
}
