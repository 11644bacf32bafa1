//! Owns the camera fleet and the global recording state.

use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::Sender;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::capture::frame::Frame;
use crate::capture::source::SourceConnector;
use crate::error::RecorderError;
use crate::events::{EventLog, RecorderEvent};
use crate::pipeline::camera::{CameraPipeline, Command};
use crate::pipeline::handoff::{handoff, HandoffReceiver};
use crate::pipeline::status::{StatusBoard, StatusEntry};
use crate::pipeline::supervisor::{ReconnectSupervisor, SupervisorPolicy};
use crate::recording::chunk::{ChunkPolicy, ChunkRecorder};
use crate::recording::chunk_index::ChunkIndexStore;
use crate::recording::paced_writer::{WriterContext, WriterOptions};
use crate::recording::sink::SinkFactory;
use crate::Config;

/// Latest frames of one camera for a viewer
pub struct ViewerFeed {
    pub camera: String,
    pub frames: HandoffReceiver<Frame>,
}

struct CameraHandle {
    name: String,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct FleetState {
    recording: bool,
    shut_down: bool,
}

/// Starts one pipeline thread per camera and fans recording commands out to
/// them. All methods take `&self`; share it behind an `Arc`.
pub struct RecordingOrchestrator {
    cameras: Mutex<Vec<CameraHandle>>,
    state: Mutex<FleetState>,
    status: StatusBoard,
    feeds: Mutex<Vec<ViewerFeed>>,
    events: EventLog,
}

impl RecordingOrchestrator {
    /// Validate the configuration, prepare the output root and start every
    /// camera. Cameras connect and reconnect on their own from here on;
    /// nothing is recorded until [`start_recording`](Self::start_recording).
    pub fn launch(
        config: &Config,
        connector: Arc<dyn SourceConnector>,
        sinks: Arc<dyn SinkFactory>,
        events: EventLog,
    ) -> Result<Self, RecorderError> {
        config.validate()?;

        let root = &config.recording.output_dir;
        fs::create_dir_all(root).map_err(|source| RecorderError::Directory {
            path: root.clone(),
            source,
        })?;

        let store = ChunkIndexStore::new(root.clone());
        let supervisor_policy = SupervisorPolicy::from(&config.supervisor);
        let options = WriterOptions {
            codec: config.recording.codec.clone(),
            max_buffer_size: config.writer.max_buffer_size,
            fallback_frame_rate: config.writer.fallback_frame_rate,
        };

        let mut handles = Vec::with_capacity(config.cameras.len());
        let mut entries = Vec::with_capacity(config.cameras.len());
        let mut feeds = Vec::with_capacity(config.cameras.len());

        for camera in &config.cameras {
            let status = Arc::new(StatusEntry::new(camera.name.as_str()));
            let supervisor = ReconnectSupervisor::new(
                &camera.name,
                &camera.url,
                connector.clone(),
                supervisor_policy,
                events.clone(),
                status.clone(),
            );
            let recorder = ChunkRecorder::new(
                WriterContext {
                    camera: camera.name.clone(),
                    sinks: sinks.clone(),
                    options: options.clone(),
                    events: events.clone(),
                },
                store.clone(),
                ChunkPolicy {
                    chunk_duration: config.recording.chunk_duration(),
                    retry_delay: supervisor_policy.reconnect_delay,
                    frame_rate: camera.frame_rate,
                    frame_size: camera.frame_size(),
                },
                status.clone(),
            );

            let (command_tx, command_rx) = flume::unbounded();
            let (viewer_tx, viewer_rx) = handoff(config.viewer.handoff_capacity);
            let pipeline = CameraPipeline::new(
                &camera.name,
                supervisor,
                recorder,
                command_rx,
                viewer_tx,
                status.clone(),
            );

            let thread_name = format!("camera-{}", camera.name);
            let thread = match std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || pipeline.run())
            {
                Ok(thread) => thread,
                Err(source) => {
                    stop_all(&mut handles);
                    return Err(RecorderError::Spawn {
                        name: thread_name,
                        source,
                    });
                }
            };

            info!(camera = %camera.name, url = %camera.url, "Camera launched");
            handles.push(CameraHandle {
                name: camera.name.clone(),
                commands: command_tx,
                thread: Some(thread),
            });
            entries.push(status);
            feeds.push(ViewerFeed {
                camera: camera.name.clone(),
                frames: viewer_rx,
            });
        }

        Ok(Self {
            cameras: Mutex::new(handles),
            state: Mutex::new(FleetState::default()),
            status: StatusBoard::new(entries),
            feeds: Mutex::new(feeds),
            events,
        })
    }

    /// Begin recording on every camera. Cameras that are down start their
    /// first chunk as soon as they deliver a frame. No-op if already recording.
    pub fn start_recording(&self) {
        let mut state = self.state.lock();
        if state.recording || state.shut_down {
            return;
        }

        for camera in self.cameras.lock().iter() {
            if camera.commands.send(Command::StartRecording).is_err() {
                warn!(camera = %camera.name, "Pipeline not running");
            }
        }
        state.recording = true;
        self.events.emit(RecorderEvent::RecordingStarted);
    }

    /// Stop recording and wait until every open chunk is finalized.
    /// No-op if not recording.
    pub fn stop_recording(&self) {
        let mut state = self.state.lock();
        if !state.recording {
            return;
        }
        self.stop_locked(&mut state);
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn cameras(&self) -> Vec<String> {
        self.cameras.lock().iter().map(|c| c.name.clone()).collect()
    }

    /// Per-camera latest-frame feeds. Only the first call gets them.
    pub fn take_viewer_feeds(&self) -> Vec<ViewerFeed> {
        std::mem::take(&mut *self.feeds.lock())
    }

    /// Finalize any recording, stop every pipeline and join its thread.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        if state.recording {
            self.stop_locked(&mut state);
        }
        state.shut_down = true;

        stop_all(&mut self.cameras.lock());
        info!("All cameras stopped");
    }

    fn stop_locked(&self, state: &mut FleetState) {
        let cameras = self.cameras.lock();
        let acks: Vec<_> = cameras
            .iter()
            .filter_map(|camera| {
                let (ack_tx, ack_rx) = flume::bounded(1);
                match camera.commands.send(Command::StopRecording(ack_tx)) {
                    Ok(()) => Some((camera.name.as_str(), ack_rx)),
                    Err(_) => {
                        warn!(camera = %camera.name, "Pipeline not running");
                        None
                    }
                }
            })
            .collect();

        for (name, ack) in acks {
            if ack.recv().is_err() {
                error!(camera = %name, "Pipeline exited before closing its chunk");
            }
        }

        state.recording = false;
        self.events.emit(RecorderEvent::RecordingStopped);
    }
}

impl Drop for RecordingOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_all(cameras: &mut [CameraHandle]) {
    for camera in cameras.iter() {
        let _ = camera.commands.send(Command::Shutdown);
    }
    for camera in cameras.iter_mut() {
        if let Some(thread) = camera.thread.take() {
            if thread.join().is_err() {
                error!(camera = %camera.name, "Pipeline thread panicked");
            }
        }
    }
}
