//! One thread per camera: supervisor ticks, frame routing, recording commands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, instrument};

use crate::capture::frame::Frame;
use crate::pipeline::handoff::HandoffSender;
use crate::pipeline::status::StatusEntry;
use crate::pipeline::supervisor::{ReconnectSupervisor, Tick};
use crate::recording::chunk::ChunkRecorder;

/// Control messages from the orchestrator
#[derive(Debug)]
pub enum Command {
    StartRecording,
    /// Answered once the current chunk is closed
    StopRecording(Sender<()>),
    Shutdown,
}

pub struct CameraPipeline {
    camera: String,
    supervisor: ReconnectSupervisor,
    recorder: ChunkRecorder,
    commands: Receiver<Command>,
    viewer: HandoffSender<Frame>,
    status: Arc<StatusEntry>,
    recording: bool,
}

impl CameraPipeline {
    pub fn new(
        camera: &str,
        supervisor: ReconnectSupervisor,
        recorder: ChunkRecorder,
        commands: Receiver<Command>,
        viewer: HandoffSender<Frame>,
        status: Arc<StatusEntry>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            supervisor,
            recorder,
            commands,
            viewer,
            status,
            recording: false,
        }
    }

    #[instrument(name = "camera", skip(self), fields(camera = %self.camera))]
    pub fn run(mut self) {
        info!("Camera pipeline started");

        loop {
            // Commands first so a stop never waits behind a long read
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle(command) {
                    return self.finish();
                }
            }

            let wait = match self.supervisor.tick() {
                Tick::Frame(frame) | Tick::Connected { frame, .. } => {
                    self.on_frame(frame);
                    Duration::ZERO
                }
                Tick::Disconnected {
                    last_frame_at,
                    backoff,
                } => {
                    // The chunk ends with the last real frame; the outage is not padded
                    self.recorder.close(last_frame_at);
                    backoff
                }
                Tick::Idle(pause) | Tick::Backoff(pause) => pause,
            };

            if !wait.is_zero() && !self.wait(wait) {
                return self.finish();
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        self.status.count_frame();
        if self.recording {
            self.recorder.record(&frame, self.supervisor.stream_info());
        }
        self.viewer.push(frame);
    }

    /// Sleep until `wait` has passed, still serving commands. False on shutdown.
    fn wait(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            match self.commands.recv_deadline(deadline) {
                Ok(command) => {
                    if !self.handle(command) {
                        return false;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return true,
                // Orchestrator is gone
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, command: Command) -> bool {
        debug!(?command, "Command");
        match command {
            Command::StartRecording => {
                self.recording = true;
                self.status.update(|s| s.recording = true);
                true
            }
            Command::StopRecording(ack) => {
                self.stop_recording();
                let _ = ack.send(());
                true
            }
            Command::Shutdown => false,
        }
    }

    fn stop_recording(&mut self) {
        self.recording = false;
        self.recorder.close(None);
        self.status.update(|s| s.recording = false);
    }

    fn finish(mut self) {
        self.stop_recording();
        self.supervisor.shutdown();
        info!("Camera pipeline stopped");
    }
}
