//! Synthetic camera for running the recorder without hardware.
//!
//! URLs look like `test://front?fps=20&width=320&height=240`. Frames are
//! JPEG-encoded moving bars emitted at the requested rate.

use std::time::{Duration, Instant};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::jpeg;
use crate::capture::source::{FrameSource, StreamInfo};
use crate::error::{ConnectError, StreamError};

pub const SCHEME: &str = "test://";

#[derive(Debug, Clone, PartialEq)]
pub struct TestPatternParams {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl Default for TestPatternParams {
    fn default() -> Self {
        Self {
            fps: 20.0,
            width: 320,
            height: 240,
            quality: 70,
        }
    }
}

impl TestPatternParams {
    pub fn parse(url: &str) -> Result<Self, ConnectError> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| ConnectError::UnsupportedUrl(url.to_string()))?;
        let mut params = Self::default();

        let Some((_, query)) = rest.split_once('?') else {
            return Ok(params);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let invalid = || ConnectError::Open {
                url: url.to_string(),
                reason: format!("invalid value for `{}`: `{}`", key, value),
            };
            match key {
                "fps" => params.fps = value.parse().map_err(|_| invalid())?,
                "width" => params.width = value.parse().map_err(|_| invalid())?,
                "height" => params.height = value.parse().map_err(|_| invalid())?,
                "quality" => params.quality = value.parse().map_err(|_| invalid())?,
                _ => {
                    return Err(ConnectError::Open {
                        url: url.to_string(),
                        reason: format!("unknown parameter `{}`", key),
                    })
                }
            }
        }

        if !(params.fps.is_finite() && params.fps > 0.0) || params.width == 0 || params.height == 0
        {
            return Err(ConnectError::Open {
                url: url.to_string(),
                reason: "fps, width and height must be positive".into(),
            });
        }

        Ok(params)
    }
}

pub struct TestPatternSource {
    params: TestPatternParams,
    interval: Duration,
    next_due: Instant,
    rendered: u64,
    closed: bool,
}

impl TestPatternSource {
    pub fn new(params: TestPatternParams) -> Self {
        let interval = Duration::from_secs_f64(1.0 / params.fps);
        Self {
            params,
            interval,
            next_due: Instant::now(),
            rendered: 0,
            closed: false,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.params.width as usize, self.params.height as usize);
        let bar = (self.rendered as usize * 4) % w.max(1);
        let mut rgb = vec![0u8; w * h * 3];

        for (y, row) in rgb.chunks_exact_mut(w * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let lit = x.abs_diff(bar) < 8;
                px[0] = if lit { 255 } else { (x * 255 / w.max(1)) as u8 };
                px[1] = (y * 255 / h.max(1)) as u8;
                px[2] = if lit { 255 } else { 64 };
            }
        }
        rgb
    }
}

impl FrameSource for TestPatternSource {
    fn read(&mut self, timeout: Duration) -> Result<Frame, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(StreamError::Timeout);
            }
            std::thread::sleep(wait);
        }

        // Never try to catch up on missed frames; a live camera wouldn't either
        self.next_due = (self.next_due + self.interval).max(Instant::now());

        let (w, h) = (self.params.width, self.params.height);
        let data = jpeg::encode_frame(&self.render(), w, h, w * 3, PixelFormat::Rgb24, self.params.quality)
            .map_err(|e| StreamError::Failed(e.to_string()))?;
        self.rendered += 1;

        Ok(Frame::new(
            data,
            FrameMetadata::new(w, h, PixelFormat::Mjpeg),
            Instant::now(),
        ))
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            frame_rate: Some(self.params.fps),
            width: Some(self.params.width),
            height: Some(self.params.height),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
