//! Time-bounded output files for one camera.
//!
//! A [`ChunkRecorder`] opens a new [`PacedWriter`] on the first frame after
//! recording starts, rotates it once it has covered the chunk duration, and
//! closes it when recording stops or the stream drops. Rotation hands the old
//! chunk's end instant to the new chunk as its clock origin, so consecutive
//! chunks tile the timeline without gaps or overlap.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate};
use tracing::{debug, warn};

use crate::capture::frame::Frame;
use crate::capture::source::StreamInfo;
use crate::events::RecorderEvent;
use crate::pipeline::status::StatusEntry;
use crate::recording::chunk_index::ChunkIndexStore;
use crate::recording::paced_writer::{PacedWriter, WriterContext, WriterStats};

/// Identity of one output file
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDescriptor {
    pub camera: String,
    pub day: NaiveDate,
    pub index: u32,
    pub path: PathBuf,
    /// Wall-clock start, as it appears in the file name
    pub created_at: DateTime<Local>,
    /// Monotonic start of the chunk's timeline
    pub started: Instant,
}

impl ChunkDescriptor {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Per-camera output settings that never change while running
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPolicy {
    pub chunk_duration: Duration,
    /// Minimum wait before opening a new file after one failed
    pub retry_delay: Duration,
    /// Overrides the stream's reported rate
    pub frame_rate: Option<f64>,
    /// Overrides the first frame's size
    pub frame_size: Option<(u32, u32)>,
}

struct ActiveChunk {
    descriptor: ChunkDescriptor,
    writer: PacedWriter,
}

pub struct ChunkRecorder {
    ctx: WriterContext,
    store: ChunkIndexStore,
    policy: ChunkPolicy,
    status: Arc<StatusEntry>,
    current: Option<ActiveChunk>,
    retry_after: Option<Instant>,
    finished: Vec<ChunkDescriptor>,
}

impl ChunkRecorder {
    pub fn new(
        ctx: WriterContext,
        store: ChunkIndexStore,
        policy: ChunkPolicy,
        status: Arc<StatusEntry>,
    ) -> Self {
        Self {
            ctx,
            store,
            policy,
            status,
            current: None,
            retry_after: None,
            finished: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<&ChunkDescriptor> {
        self.current.as_ref().map(|c| &c.descriptor)
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Chunks closed successfully, oldest first
    pub fn finished(&self) -> &[ChunkDescriptor] {
        &self.finished
    }

    /// Route a frame into the current chunk, opening or rotating as needed
    pub fn record(&mut self, frame: &Frame, info: StreamInfo) {
        let arrival = frame.timestamp;
        let mut origin = arrival;

        if let Some(active) = &self.current {
            if active.writer.has_failed() {
                self.close(None);
                self.retry_after = Some(arrival + self.policy.retry_delay);
                warn!(camera = %self.ctx.camera, "Chunk failed, retrying in {:?}", self.policy.retry_delay);
            } else {
                let boundary = active.descriptor.started + self.policy.chunk_duration;
                if arrival >= boundary {
                    self.close(Some(boundary));
                    if arrival.duration_since(boundary) < self.policy.chunk_duration {
                        origin = boundary;
                    }
                }
            }
        }

        if self.current.is_none() {
            if self.retry_after.is_some_and(|at| arrival < at) {
                return;
            }
            self.retry_after = None;
            if !self.open(frame, info, origin) {
                self.retry_after = Some(arrival + self.policy.retry_delay);
                return;
            }
        }

        if let Some(active) = &self.current {
            active.writer.submit(frame.clone(), arrival);
        }
    }

    /// Finish the current chunk with its timeline ending at `end`
    /// (now when `None`). Does nothing if no chunk is open.
    pub fn close(&mut self, end: Option<Instant>) -> Option<WriterStats> {
        let active = self.current.take()?;
        let stats = active.writer.stop_at(end.unwrap_or_else(Instant::now));
        self.status.update(|s| s.current_chunk = None);

        let descriptor = active.descriptor;
        match stats {
            Some(stats) if !stats.failed => {
                self.ctx.events.emit(RecorderEvent::FileSaved {
                    camera: self.ctx.camera.clone(),
                    file: descriptor.path.display().to_string(),
                });
                self.finished.push(descriptor);
            }
            // The writer already reported why
            _ => debug!(path = %descriptor.path.display(), "Chunk closed after failure"),
        }
        stats
    }

    fn open(&mut self, frame: &Frame, info: StreamInfo, origin: Instant) -> bool {
        let camera = self.ctx.camera.clone();
        let created_at = wall_time_of(origin);
        let day = created_at.date_naive();

        let dir = self.store.day_dir(day);
        if let Err(e) = fs::create_dir_all(&dir) {
            self.ctx.events.error(
                &camera,
                format!("Cannot create directory {}: {}", dir.display(), e),
            );
            return false;
        }

        let index = match self.store.next_index(&camera, day) {
            Ok(index) => index,
            Err(e) => {
                self.ctx.events.error(&camera, e.to_string());
                return false;
            }
        };

        let path = self
            .store
            .chunk_path(&camera, &created_at, index, self.ctx.sinks.extension());
        let frame_rate = self.policy.frame_rate.or(info.frame_rate);
        let frame_size = self
            .policy
            .frame_size
            .or_else(|| Some((info.width?, info.height?)))
            .unwrap_or_else(|| frame.size());

        let writer = match PacedWriter::open(
            &self.ctx,
            &path,
            frame_rate,
            frame_size,
            frame.meta.format,
            origin,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.ctx.events.error(
                    &camera,
                    format!("Failed to open video writer for camera {}: {}", camera, e),
                );
                return false;
            }
        };

        let descriptor = ChunkDescriptor {
            camera: camera.clone(),
            day,
            index,
            path,
            created_at,
            started: origin,
        };
        let file_name = descriptor.file_name();
        self.status.update(|s| s.current_chunk = Some(file_name));
        self.ctx.events.emit(RecorderEvent::FileStarted {
            camera,
            file: descriptor.path.display().to_string(),
        });

        self.current = Some(ActiveChunk { descriptor, writer });
        true
    }
}

impl Drop for ChunkRecorder {
    fn drop(&mut self) {
        self.close(None);
    }
}

/// Local wall-clock time corresponding to a monotonic instant
pub fn wall_time_of(instant: Instant) -> DateTime<Local> {
    let now = Local::now();
    let age = Instant::now().saturating_duration_since(instant);
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(now)
}
