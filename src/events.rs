//! Lifecycle event log.
//!
//! Pipelines emit [`RecorderEvent`]s without ever blocking: events go into an
//! unbounded channel drained by a logger thread, which mirrors them to
//! `tracing` and appends them to a daily file `camera_log_{YYYYMMDD}.log`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::{Local, NaiveDate};
use flume::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::error::RecorderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    RecordingStarted,
    RecordingStopped,
    FileStarted { camera: String, file: String },
    FileSaved { camera: String, file: String },
    CameraDisconnected { camera: String },
    ReconnectAttempt { camera: String },
    CameraConnected { camera: String, reconnected: bool },
    Warning { camera: Option<String>, message: String },
    Error { camera: Option<String>, message: String },
}

impl RecorderEvent {
    pub fn level(&self) -> Level {
        match self {
            RecorderEvent::CameraDisconnected { .. } | RecorderEvent::Warning { .. } => {
                Level::Warning
            }
            RecorderEvent::Error { .. } => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn camera(&self) -> Option<&str> {
        match self {
            RecorderEvent::RecordingStarted | RecorderEvent::RecordingStopped => None,
            RecorderEvent::FileStarted { camera, .. }
            | RecorderEvent::FileSaved { camera, .. }
            | RecorderEvent::CameraDisconnected { camera }
            | RecorderEvent::ReconnectAttempt { camera }
            | RecorderEvent::CameraConnected { camera, .. } => Some(camera),
            RecorderEvent::Warning { camera, .. } | RecorderEvent::Error { camera, .. } => {
                camera.as_deref()
            }
        }
    }
}

impl fmt::Display for RecorderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderEvent::RecordingStarted => write!(f, "Recording started"),
            RecorderEvent::RecordingStopped => write!(f, "Recording stopped"),
            RecorderEvent::FileStarted { camera, file } => {
                write!(f, "Started recording file: {} for camera {}", file, camera)
            }
            RecorderEvent::FileSaved { camera, file } => {
                write!(f, "Saved recording file: {} for camera {}", file, camera)
            }
            RecorderEvent::CameraDisconnected { camera } => {
                write!(f, "Camera {} disconnected", camera)
            }
            RecorderEvent::ReconnectAttempt { camera } => {
                write!(f, "Attempting to reconnect camera {}", camera)
            }
            RecorderEvent::CameraConnected {
                camera,
                reconnected: false,
            } => write!(f, "Camera {} connected", camera),
            RecorderEvent::CameraConnected {
                camera,
                reconnected: true,
            } => write!(f, "Camera {} reconnected", camera),
            RecorderEvent::Warning {
                camera: Some(camera),
                message,
            } => write!(f, "Warning for camera {}: {}", camera, message),
            RecorderEvent::Warning {
                camera: None,
                message,
            } => write!(f, "Warning: {}", message),
            RecorderEvent::Error {
                camera: Some(camera),
                message,
            } => write!(f, "Error occurred for camera {}: {}", camera, message),
            RecorderEvent::Error {
                camera: None,
                message,
            } => write!(f, "Error occurred: {}", message),
        }
    }
}

/// Cheap, cloneable handle for emitting events
#[derive(Clone)]
pub struct EventLog {
    tx: Option<Sender<RecorderEvent>>,
}

impl EventLog {
    /// Events only reach `tracing`
    pub fn tracing_only() -> Self {
        Self { tx: None }
    }

    /// Route events into a channel; the caller owns the receiving end
    pub fn channel() -> (Self, Receiver<RecorderEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Start the file-backed logger thread
    pub fn spawn(log_dir: impl Into<PathBuf>) -> Result<(Self, EventLogWorker), RecorderError> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir).map_err(|source| RecorderError::Directory {
            path: log_dir.clone(),
            source,
        })?;

        let (log, rx) = Self::channel();
        let mut file = DailyLogFile::new(log_dir);
        let handle = std::thread::Builder::new()
            .name("event-log".into())
            .spawn(move || {
                for event in rx.iter() {
                    trace_event(&event);
                    if let Err(e) = file.append(event.level(), &event.to_string()) {
                        error!("Failed to write event log: {}", e);
                    }
                }
            })
            .map_err(|source| RecorderError::Spawn {
                name: "event-log".into(),
                source,
            })?;

        Ok((log, EventLogWorker { handle }))
    }

    /// Fire-and-forget
    pub fn emit(&self, event: RecorderEvent) {
        match &self.tx {
            Some(tx) => {
                if let Err(flume::SendError(event)) = tx.send(event) {
                    trace_event(&event);
                }
            }
            None => trace_event(&event),
        }
    }

    pub fn warning(&self, camera: &str, message: impl Into<String>) {
        self.emit(RecorderEvent::Warning {
            camera: Some(camera.to_string()),
            message: message.into(),
        });
    }

    pub fn error(&self, camera: &str, message: impl Into<String>) {
        self.emit(RecorderEvent::Error {
            camera: Some(camera.to_string()),
            message: message.into(),
        });
    }
}

/// Joins the logger thread once every [`EventLog`] clone is dropped
pub struct EventLogWorker {
    handle: JoinHandle<()>,
}

impl EventLogWorker {
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Event log thread panicked");
        }
    }
}

fn trace_event(event: &RecorderEvent) {
    let camera = event.camera().unwrap_or("-");
    match event.level() {
        Level::Info => info!(target: "vigil::events", camera, "{}", event),
        Level::Warning => warn!(target: "vigil::events", camera, "{}", event),
        Level::Error => error!(target: "vigil::events", camera, "{}", event),
    }
}

/// Append-only log file that rolls over at local midnight
pub struct DailyLogFile {
    dir: PathBuf,
    date: Option<NaiveDate>,
    file: Option<BufWriter<File>>,
}

impl DailyLogFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            date: None,
            file: None,
        }
    }

    pub fn path_for(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("camera_log_{}.log", date.format("%Y%m%d")))
    }

    pub fn append(&mut self, level: Level, message: &str) -> io::Result<()> {
        let now = Local::now();
        let today = now.date_naive();

        if self.date != Some(today) || self.file.is_none() {
            let path = Self::path_for(&self.dir, today);
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.file = Some(BufWriter::new(file));
            self.date = Some(today);
        }

        if let Some(file) = self.file.as_mut() {
            writeln!(
                file,
                "{} - {} - {}",
                now.format("%Y-%m-%d %H:%M:%S,%3f"),
                level,
                message
            )?;
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_distinguish_connect_and_reconnect() {
        let first = RecorderEvent::CameraConnected {
            camera: "front".into(),
            reconnected: false,
        };
        let again = RecorderEvent::CameraConnected {
            camera: "front".into(),
            reconnected: true,
        };
        assert_eq!(first.to_string(), "Camera front connected");
        assert_eq!(again.to_string(), "Camera front reconnected");
        assert_eq!(first.level(), Level::Info);
    }

    #[test]
    fn levels_follow_severity() {
        let disconnect = RecorderEvent::CameraDisconnected {
            camera: "rear".into(),
        };
        assert_eq!(disconnect.level(), Level::Warning);
        assert_eq!(disconnect.camera(), Some("rear"));

        let err = RecorderEvent::Error {
            camera: None,
            message: "disk full".into(),
        };
        assert_eq!(err.level(), Level::Error);
        assert_eq!(err.to_string(), "Error occurred: disk full");
    }

    #[test]
    fn channel_delivers_events() {
        let (log, rx) = EventLog::channel();
        log.emit(RecorderEvent::RecordingStarted);
        log.error("front", "boom");
        assert_eq!(rx.try_recv().unwrap(), RecorderEvent::RecordingStarted);
        assert_eq!(
            rx.try_recv().unwrap(),
            RecorderEvent::Error {
                camera: Some("front".into()),
                message: "boom".into()
            }
        );
    }

    #[test]
    fn spawned_logger_writes_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let (log, worker) = EventLog::spawn(dir.path()).unwrap();
        log.emit(RecorderEvent::FileStarted {
            camera: "front".into(),
            file: "front_20240101_000000_0.mjpeg".into(),
        });
        log.warning("front", "invalid frame rate");
        drop(log);
        worker.join();

        let path = DailyLogFile::path_for(dir.path(), Local::now().date_naive());
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(
            " - INFO - Started recording file: front_20240101_000000_0.mjpeg for camera front"
        ));
        assert!(lines[1].contains(" - WARNING - "));
    }
}
