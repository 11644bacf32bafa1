//! Headless viewer: keeps the newest frame per camera and renders one status
//! line each.

use std::fmt;
use std::time::{Duration, Instant};

use crate::pipeline::status::{ConnectionState, StatusBoard};
use crate::recording::orchestrator::ViewerFeed;

/// One rendered camera row
#[derive(Debug, Clone, PartialEq)]
pub struct CameraLine {
    pub camera: String,
    pub state: ConnectionState,
    pub recording: bool,
    /// Frames per second received since the previous render
    pub fps: f64,
    pub resolution: Option<(u32, u32)>,
    pub chunk: Option<String>,
    pub reconnects: u64,
}

impl fmt::Display for CameraLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<12} {:<12}", self.camera, self.state.to_string())?;
        match self.resolution {
            Some((w, h)) => write!(f, " {:>5.1} fps {:>4}x{:<4}", self.fps, w, h)?,
            None => write!(f, " {:>5.1} fps {:>9}", self.fps, "-")?,
        }
        if self.recording {
            write!(f, " REC {}", self.chunk.as_deref().unwrap_or("(waiting for frames)"))?;
        }
        if self.reconnects > 0 {
            write!(f, " reconnects={}", self.reconnects)?;
        }
        Ok(())
    }
}

struct Tracked {
    feed: ViewerFeed,
    resolution: Option<(u32, u32)>,
    frames_at_render: u64,
}

pub struct StatusDisplay {
    tracked: Vec<Tracked>,
    board: StatusBoard,
    rendered_at: Instant,
}

impl StatusDisplay {
    pub fn new(feeds: Vec<ViewerFeed>, board: StatusBoard) -> Self {
        Self {
            tracked: feeds
                .into_iter()
                .map(|feed| Tracked {
                    feed,
                    resolution: None,
                    frames_at_render: 0,
                })
                .collect(),
            board,
            rendered_at: Instant::now(),
        }
    }

    /// Take the newest frame of every feed, discarding the older ones
    pub fn poll(&mut self) {
        for tracked in &mut self.tracked {
            if let Some(frame) = tracked.feed.frames.latest() {
                tracked.resolution = Some(frame.size());
            }
        }
    }

    /// Poll, then build one line per camera
    pub fn render(&mut self) -> Vec<CameraLine> {
        self.poll();

        let elapsed = self.rendered_at.elapsed().max(Duration::from_millis(1));
        self.rendered_at = Instant::now();

        let mut lines = Vec::with_capacity(self.tracked.len());
        for tracked in &mut self.tracked {
            let Some(entry) = self
                .board
                .entries()
                .find(|e| e.camera() == tracked.feed.camera)
            else {
                continue;
            };
            let status = entry.load();
            let frames = entry.frames_received();
            let fps = frames.saturating_sub(tracked.frames_at_render) as f64 / elapsed.as_secs_f64();
            tracked.frames_at_render = frames;

            lines.push(CameraLine {
                camera: tracked.feed.camera.clone(),
                state: status.state,
                recording: status.recording,
                fps,
                resolution: tracked.resolution,
                chunk: status.current_chunk.clone(),
                reconnects: status.reconnects,
            });
        }
        lines
    }
}
