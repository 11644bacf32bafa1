use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;
use vigil::testing::{MemorySinkFactory, ScriptedConnector, Step};
use vigil::{CameraSpec, Config, ConnectionState, EventLog, RecorderError, RecorderEvent, RecordingOrchestrator};

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.recording.output_dir = root.to_path_buf();
    config.supervisor.reconnect_delay_ms = 100;
    config.supervisor.staleness_window_ms = Some(200);
    config.supervisor.read_timeout_ms = 20;
    config.supervisor.connect_timeout_ms = 20;
    config.supervisor.error_pause_ms = 10;
    config.cameras = vec![CameraSpec::new("front", "scripted://front")];
    config
}

fn steady(count: usize) -> Vec<Step> {
    ScriptedConnector::steady(count, Duration::from_millis(20))
}

struct Harness {
    orchestrator: RecordingOrchestrator,
    connector: Arc<ScriptedConnector>,
    events: Receiver<RecorderEvent>,
    seen: Vec<RecorderEvent>,
}

impl Harness {
    fn launch(config: &Config, connector: ScriptedConnector, sinks: &MemorySinkFactory) -> Self {
        let (events, rx) = EventLog::channel();
        let connector = Arc::new(connector.with_frame_rate(50.0));
        let orchestrator =
            RecordingOrchestrator::launch(config, connector.clone(), Arc::new(sinks.clone()), events)
                .unwrap();
        Self {
            orchestrator,
            connector,
            events: rx,
            seen: Vec::new(),
        }
    }

    fn wait_for(&mut self, what: &str, pred: impl Fn(&RecorderEvent) -> bool) -> RecorderEvent {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let event = self
                .events
                .recv_deadline(deadline)
                .unwrap_or_else(|_| panic!("timed out waiting for {}; saw {:?}", what, self.seen));
            self.seen.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    fn drain(&mut self) {
        self.seen.extend(self.events.try_iter());
    }

    fn count(&self, pred: impl Fn(&RecorderEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }
}

fn saved_files(sinks: &MemorySinkFactory) -> Vec<String> {
    sinks
        .files()
        .into_iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

/// Longest stretch of one frame written back to back
fn longest_run(frames: &[u64]) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for (i, seq) in frames.iter().enumerate() {
        run = if i > 0 && frames[i - 1] == *seq { run + 1 } else { 1 };
        longest = longest.max(run);
    }
    longest
}

#[test]
fn reconnect_continues_in_a_new_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let sinks = MemorySinkFactory::new();
    let connector = ScriptedConnector::new(vec![steady(15), steady(15)]);
    let mut h = Harness::launch(&config(tmp.path()), connector, &sinks);

    h.orchestrator.start_recording();
    h.wait_for("first chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));
    h.wait_for("disconnect", |e| matches!(e, RecorderEvent::CameraDisconnected { .. }));
    h.wait_for("first chunk saved", |e| matches!(e, RecorderEvent::FileSaved { .. }));
    h.wait_for("reconnect", |e| {
        matches!(e, RecorderEvent::CameraConnected { reconnected: true, .. })
    });
    h.wait_for("second chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));

    h.orchestrator.stop_recording();
    h.drain();
    assert_eq!(h.count(|e| matches!(e, RecorderEvent::FileSaved { .. })), 2);
    assert!(h.count(|e| matches!(e, RecorderEvent::ReconnectAttempt { .. })) >= 1);
    assert_eq!(h.connector.opens(), 2);

    let names = saved_files(&sinks);
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|n| n.starts_with("front_") && n.ends_with("_0.mem")));
    assert!(names.iter().any(|n| n.ends_with("_1.mem")));
    for (_, file) in sinks.files() {
        assert!(file.closed);
        assert!(!file.frames.is_empty());
    }

    let status = h.orchestrator.status().get("front").unwrap();
    assert_eq!(status.reconnects, 1);
    assert!(!status.recording);
    assert_eq!(status.current_chunk, None);
}

#[test]
fn start_and_stop_are_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let sinks = MemorySinkFactory::new();
    let connector = ScriptedConnector::new(vec![steady(200)]);
    let mut h = Harness::launch(&config(tmp.path()), connector, &sinks);

    // Stopping before starting does nothing
    h.orchestrator.stop_recording();
    h.orchestrator.start_recording();
    h.orchestrator.start_recording();
    assert!(h.orchestrator.is_recording());
    h.wait_for("chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));

    h.orchestrator.stop_recording();
    h.orchestrator.stop_recording();
    assert!(!h.orchestrator.is_recording());

    h.drain();
    assert_eq!(h.count(|e| *e == RecorderEvent::RecordingStarted), 1);
    assert_eq!(h.count(|e| *e == RecorderEvent::RecordingStopped), 1);
    assert_eq!(h.count(|e| matches!(e, RecorderEvent::FileSaved { .. })), 1);

    // A second session gets the next index, same day
    h.orchestrator.start_recording();
    h.wait_for("second chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));
    h.orchestrator.shutdown();
    h.orchestrator.shutdown();

    let names = saved_files(&sinks);
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|n| n.ends_with("_1.mem")));
}

#[test]
fn restart_resumes_numbering_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let sinks = MemorySinkFactory::new();
    let config = config(tmp.path());

    for _ in 0..2 {
        let mut h = Harness::launch(&config, ScriptedConnector::new(vec![steady(100)]), &sinks);
        h.orchestrator.start_recording();
        h.wait_for("chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));
        // Dropping shuts the fleet down and finalizes the chunk
        drop(h.orchestrator);
    }

    let mut indices: Vec<u32> = sinks
        .files()
        .iter()
        .map(|(path, _)| {
            let name = path.file_stem().unwrap().to_str().unwrap().to_owned();
            name.rsplit('_').next().unwrap().parse().unwrap()
        })
        .collect();
    indices.sort();
    assert_eq!(indices, vec![0, 1]);
    assert!(sinks.files().iter().all(|(_, f)| f.closed));
}

#[test]
fn dead_camera_does_not_hold_up_the_others() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.cameras.push(CameraSpec::new("rear", "scripted://rear"));
    let sinks = MemorySinkFactory::new();
    // One script only: whichever camera opens second never connects
    let connector = ScriptedConnector::new(vec![steady(200)]);
    let mut h = Harness::launch(&config, connector, &sinks);

    h.orchestrator.start_recording();
    let started = h.wait_for("chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));
    let live = started.camera().unwrap().to_owned();
    let dead = if live == "front" { "rear" } else { "front" };

    h.wait_for("retry of the dead camera", |e| {
        matches!(e, RecorderEvent::ReconnectAttempt { camera } if camera == dead)
    });
    let board = h.orchestrator.status();
    assert_eq!(board.state(&live), Some(ConnectionState::Connected));
    assert_ne!(board.state(dead), Some(ConnectionState::Connected));
    assert!(board.get(dead).unwrap().current_chunk.is_none());

    h.orchestrator.stop_recording();
    assert_eq!(saved_files(&sinks).len(), 1);
}

#[test]
fn unusable_output_root_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let config = config(&blocker.join("recordings"));
    let result = RecordingOrchestrator::launch(
        &config,
        Arc::new(ScriptedConnector::new(vec![])),
        Arc::new(MemorySinkFactory::new()),
        EventLog::tracing_only(),
    );
    assert!(matches!(result, Err(RecorderError::Directory { .. })));
}

#[test]
fn viewer_feed_gets_live_frames_without_recording() {
    let tmp = tempfile::tempdir().unwrap();
    let sinks = MemorySinkFactory::new();
    let h = Harness::launch(&config(tmp.path()), ScriptedConnector::new(vec![steady(100)]), &sinks);

    let feeds = h.orchestrator.take_viewer_feeds();
    assert_eq!(feeds.len(), 1);
    assert!(h.orchestrator.take_viewer_feeds().is_empty());

    let frame = feeds[0]
        .frames
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(frame.size(), (4, 4));
    assert!(!h.orchestrator.is_recording());
    assert!(sinks.files().is_empty());
}

#[test]
fn shutdown_is_not_held_up_by_a_silent_new_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    // Long enough that waiting out the first frame would be noticed
    config.supervisor.staleness_window_ms = Some(3_000);
    let sinks = MemorySinkFactory::new();
    let connector = ScriptedConnector::new(vec![vec![Step::FrameAfter(Duration::from_secs(60))]]);
    let h = Harness::launch(&config, connector, &sinks);

    h.orchestrator.start_recording();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.connector.opens(), 1);

    let started = Instant::now();
    h.orchestrator.stop_recording();
    assert!(started.elapsed() < Duration::from_millis(300), "stop took {:?}", started.elapsed());

    let started = Instant::now();
    h.orchestrator.shutdown();
    assert!(started.elapsed() < Duration::from_millis(300), "shutdown took {:?}", started.elapsed());
    assert!(sinks.files().is_empty());
}

#[test]
fn short_stall_is_padded_inside_a_rotating_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.recording.chunk_duration_secs = 1;
    // Outlasts the stall, so the camera stays connected through it
    config.supervisor.staleness_window_ms = Some(1_000);
    let sinks = MemorySinkFactory::new();

    let mut script = steady(15);
    script.push(Step::FrameAfter(Duration::from_millis(400)));
    script.extend(steady(90));
    let mut h = Harness::launch(&config, ScriptedConnector::new(vec![script]), &sinks);

    h.orchestrator.start_recording();
    h.wait_for("first chunk", |e| matches!(e, RecorderEvent::FileStarted { .. }));
    h.wait_for("rotation", |e| matches!(e, RecorderEvent::FileStarted { .. }));
    std::thread::sleep(Duration::from_millis(200));
    h.orchestrator.stop_recording();
    h.drain();

    assert_eq!(h.count(|e| matches!(e, RecorderEvent::CameraDisconnected { .. })), 0);
    assert_eq!(h.connector.opens(), 1);

    let files = sinks.files();
    assert_eq!(files.len(), 2);
    let (first_path, first) = &files[0];
    assert!(first_path.to_string_lossy().ends_with("_0.mem"));

    // One second at the stream's 50fps, the stall included
    assert_eq!(first.frames.len(), 50);
    let longest_repeat = longest_run(&first.frames);
    assert!(longest_repeat >= 15, "stall padded with only {} repeats", longest_repeat);

    // The next chunk carries on from the frames after the stall
    let (_, second) = &files[1];
    assert!(second.closed);
    assert!(!second.frames.is_empty());
    assert!(second.frames[0] >= *first.frames.last().unwrap());
}

