//! Scripted sources and in-memory sinks for driving the recorder without
//! cameras or encoders.

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameSource, SourceConnector, StreamInfo};
use crate::error::{ConnectError, SinkError, StreamError};
use crate::recording::sink::{MediaSink, SinkFactory, SinkParams};

pub const FRAME_WIDTH: u32 = 4;
pub const FRAME_HEIGHT: u32 = 4;

/// One scripted read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A frame, immediately
    Frame,
    /// A frame after a delay; a shorter read timeout yields `Timeout` first
    FrameAfter(Duration),
    /// An immediate read error
    Fail,
    EndOfStream,
}

/// Opens a fresh [`ScriptedSource`] per connection, one script each. Once the
/// scripts run out every open fails.
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    refuse: AtomicUsize,
    opens: AtomicUsize,
    info: StreamInfo,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            refuse: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            info: StreamInfo {
                frame_rate: None,
                width: Some(FRAME_WIDTH),
                height: Some(FRAME_HEIGHT),
            },
        }
    }

    /// Fail the first `n` opens without consuming a script
    pub fn refuse_first(self, n: usize) -> Self {
        self.refuse.store(n, Ordering::Relaxed);
        self
    }

    /// Frame rate every opened stream reports
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.info.frame_rate = Some(fps);
        self
    }

    /// Successful opens so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// `count` frames spaced `interval` apart
    pub fn steady(count: usize, interval: Duration) -> Vec<Step> {
        vec![Step::FrameAfter(interval); count]
    }
}

impl SourceConnector for ScriptedConnector {
    fn open(&self, url: &str, _timeout: Duration) -> Result<Box<dyn FrameSource>, ConnectError> {
        let refused = self
            .refuse
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        let script = if refused { None } else { self.scripts.lock().pop_front() };

        let Some(script) = script else {
            return Err(ConnectError::Open {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        };

        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ScriptedSource::new(script, self.info)))
    }
}

/// Plays back a script of reads, then behaves like a silent camera
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    info: StreamInfo,
    sequence: u64,
    closed: bool,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>, info: StreamInfo) -> Self {
        Self {
            steps: steps.into(),
            info,
            sequence: 0,
            closed: false,
        }
    }

    fn frame(&mut self) -> Frame {
        self.sequence += 1;
        let mut meta = FrameMetadata::new(FRAME_WIDTH, FRAME_HEIGHT, PixelFormat::Rgb24);
        meta.sequence = self.sequence;
        let shade = (self.sequence % 256) as u8;
        Frame::new(
            vec![shade; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize],
            meta,
            Instant::now(),
        )
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self, timeout: Duration) -> Result<Frame, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        match self.steps.pop_front() {
            Some(Step::Frame) => Ok(self.frame()),
            Some(Step::FrameAfter(delay)) => {
                if delay > timeout {
                    std::thread::sleep(timeout);
                    self.steps.push_front(Step::FrameAfter(delay - timeout));
                    Err(StreamError::Timeout)
                } else {
                    std::thread::sleep(delay);
                    Ok(self.frame())
                }
            }
            Some(Step::Fail) => Err(StreamError::Failed("scripted failure".into())),
            Some(Step::EndOfStream) => Err(StreamError::EndOfStream),
            None => {
                std::thread::sleep(timeout);
                Err(StreamError::Timeout)
            }
        }
    }

    fn info(&self) -> StreamInfo {
        self.info
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// What a [`MemorySink`] received
#[derive(Debug, Clone, Default)]
pub struct RecordedFile {
    pub params: Option<SinkParams>,
    /// Source sequence number of every written frame, repeats included
    pub frames: Vec<u64>,
    pub closed: bool,
}

type Files = Arc<Mutex<BTreeMap<PathBuf, RecordedFile>>>;

/// Records writes in memory. Opening still creates an empty file at the path
/// so on-disk index recovery sees it.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    files: Files,
    fail_after: Option<u64>,
    write_delay: Option<Duration>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sink errors on the write after `n` successful ones
    pub fn failing_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Slow every write down, as a busy disk would
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn file(&self, path: &Path) -> Option<RecordedFile> {
        self.files.lock().get(path).cloned()
    }

    /// Every opened file, ordered by path
    pub fn files(&self) -> Vec<(PathBuf, RecordedFile)> {
        self.files
            .lock()
            .iter()
            .map(|(p, f)| (p.clone(), f.clone()))
            .collect()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn extension(&self) -> &str {
        "mem"
    }

    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn MediaSink>, SinkError> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| SinkError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        self.files.lock().insert(
            path.to_path_buf(),
            RecordedFile {
                params: Some(params.clone()),
                ..RecordedFile::default()
            },
        );

        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            files: self.files.clone(),
            fail_after: self.fail_after,
            write_delay: self.write_delay,
            writes: 0,
        }))
    }
}

pub struct MemorySink {
    path: PathBuf,
    files: Files,
    fail_after: Option<u64>,
    write_delay: Option<Duration>,
    writes: u64,
}

impl MediaSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.fail_after.is_some_and(|n| self.writes >= n) {
            return Err(SinkError::Write {
                path: self.path.clone(),
                source: std::io::Error::other("disk full"),
            });
        }
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }

        self.writes += 1;
        if let Some(file) = self.files.lock().get_mut(&self.path) {
            file.frames.push(frame.meta.sequence);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.files.lock().get_mut(&self.path) {
            file.closed = true;
        }
        Ok(())
    }
}
