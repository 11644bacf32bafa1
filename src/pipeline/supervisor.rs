//! Per-camera connection state machine.
//!
//! ```text
//!  Disconnected ──open+read ok──▶ Connected ──no frame > window──▶ Stale
//!       ▲  │ fail                     ▲                             │
//!       └──┘ (backoff)                └──── open+read ok ── Reconnecting ◀┘
//!                                                           │  ▲ fail (backoff)
//!                                                           └──┘
//! ```
//!
//! The supervisor never sleeps. [`ReconnectSupervisor::tick`] does one unit of
//! blocking I/O and tells the caller what happened and how long to wait, so the
//! caller can keep listening for commands while it waits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::Counter;
use tracing::{debug, info, warn};

use crate::capture::frame::Frame;
use crate::capture::source::{SourceConnector, StreamHandle, StreamInfo};
use crate::error::StreamError;
use crate::events::{EventLog, RecorderEvent};
use crate::pipeline::status::{ConnectionState, StatusEntry};
use crate::SupervisorConfig;

/// Timing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub reconnect_delay: Duration,
    pub staleness_window: Duration,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub error_pause: Duration,
}

impl From<&SupervisorConfig> for SupervisorPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            staleness_window: config.staleness_window(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.connect_timeout(),
            error_pause: config.error_pause(),
        }
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// Outcome of one supervisor step
#[derive(Debug)]
pub enum Tick {
    /// A frame from a healthy stream
    Frame(Frame),
    /// The stream (re)opened and produced this frame
    Connected { frame: Frame, reconnected: bool },
    /// Read failed within the staleness window; wait this long before the next tick
    Idle(Duration),
    /// The stream went stale and was closed. Any open chunk must end at
    /// `last_frame_at`; wait `backoff` before the next tick.
    Disconnected {
        last_frame_at: Option<Instant>,
        backoff: Duration,
    },
    /// A connection attempt failed; wait before the next tick
    Backoff(Duration),
}

pub struct ReconnectSupervisor {
    camera: String,
    url: String,
    connector: Arc<dyn SourceConnector>,
    policy: SupervisorPolicy,
    handle: Option<StreamHandle>,
    /// Opened but no frame yet; the attempt fails at this deadline
    first_frame_deadline: Option<Instant>,
    state: ConnectionState,
    ever_connected: bool,
    attempts: u64,
    last_frame_at: Option<Instant>,
    events: EventLog,
    status: Arc<StatusEntry>,
    reconnects_total: Counter,
}

impl ReconnectSupervisor {
    pub fn new(
        camera: &str,
        url: &str,
        connector: Arc<dyn SourceConnector>,
        policy: SupervisorPolicy,
        events: EventLog,
        status: Arc<StatusEntry>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            url: url.to_string(),
            connector,
            policy,
            handle: None,
            first_frame_deadline: None,
            state: ConnectionState::Disconnected,
            ever_connected: false,
            attempts: 0,
            last_frame_at: None,
            events,
            status,
            reconnects_total: metrics::counter!("vigil_reconnect_attempts_total", "camera" => camera.to_string()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// What the current stream reports about itself
    pub fn stream_info(&self) -> StreamInfo {
        self.handle.as_ref().map(|h| h.info()).unwrap_or_default()
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    /// Do one step of blocking work: a read when connected or awaiting a
    /// fresh stream, a connection attempt otherwise. No step blocks longer
    /// than the connect or read timeout.
    pub fn tick(&mut self) -> Tick {
        if let Some(deadline) = self.first_frame_deadline {
            return self.await_first_frame(deadline);
        }
        match self.state {
            ConnectionState::Connected => self.read_connected(),
            ConnectionState::Stale => {
                self.set_state(ConnectionState::Reconnecting);
                self.attempt_connect()
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => self.attempt_connect(),
        }
    }

    /// Close the stream for good
    pub fn shutdown(&mut self) {
        self.first_frame_deadline = None;
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        debug!(camera = %self.camera, "Supervisor shut down");
    }

    fn read_connected(&mut self) -> Tick {
        let Some(handle) = self.handle.as_mut() else {
            return self.mark_stale();
        };

        match handle.read(self.policy.read_timeout) {
            Ok(frame) => {
                self.last_frame_at = Some(frame.timestamp);
                Tick::Frame(frame)
            }
            Err(err) => {
                let silent_for = self
                    .last_frame_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if silent_for > self.policy.staleness_window {
                    debug!(camera = %self.camera, ?silent_for, "Last read error: {}", err);
                    return self.mark_stale();
                }

                match err {
                    // The read already waited
                    StreamError::Timeout => Tick::Idle(Duration::ZERO),
                    other => {
                        debug!(camera = %self.camera, "Read failed: {}", other);
                        Tick::Idle(self.policy.error_pause)
                    }
                }
            }
        }
    }

    fn mark_stale(&mut self) -> Tick {
        warn!(camera = %self.camera, "No frames for {:?}, closing stream", self.policy.staleness_window);
        self.set_state(ConnectionState::Stale);
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.events.emit(RecorderEvent::CameraDisconnected {
            camera: self.camera.clone(),
        });

        Tick::Disconnected {
            last_frame_at: self.last_frame_at,
            backoff: self.policy.reconnect_delay,
        }
    }

    fn attempt_connect(&mut self) -> Tick {
        self.attempts += 1;
        if self.ever_connected || self.attempts > 1 {
            self.set_state(ConnectionState::Reconnecting);
            self.reconnects_total.increment(1);
            self.events.emit(RecorderEvent::ReconnectAttempt {
                camera: self.camera.clone(),
            });
        }

        let handle = match StreamHandle::open(
            self.connector.as_ref(),
            &self.camera,
            &self.url,
            self.policy.connect_timeout,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.events
                    .error(&self.camera, format!("Cannot open stream: {}", e));
                return Tick::Backoff(self.policy.reconnect_delay);
            }
        };

        // A connection only counts once it delivers a frame. Slow first
        // frames get the whole staleness window, one read timeout per tick.
        let window = self.policy.staleness_window.max(self.policy.read_timeout);
        let deadline = Instant::now() + window;
        self.handle = Some(handle);
        self.first_frame_deadline = Some(deadline);
        self.await_first_frame(deadline)
    }

    fn await_first_frame(&mut self, deadline: Instant) -> Tick {
        let Some(handle) = self.handle.as_mut() else {
            self.first_frame_deadline = None;
            return Tick::Backoff(self.policy.reconnect_delay);
        };

        let read_timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(self.policy.read_timeout);
        match handle.read(read_timeout) {
            Ok(frame) => self.connected(frame),
            Err(StreamError::Timeout) if Instant::now() < deadline => Tick::Idle(Duration::ZERO),
            Err(e) => {
                self.first_frame_deadline = None;
                if let Some(mut handle) = self.handle.take() {
                    handle.close();
                }
                self.events
                    .error(&self.camera, format!("Stream opened but no frame: {}", e));
                Tick::Backoff(self.policy.reconnect_delay)
            }
        }
    }

    fn connected(&mut self, frame: Frame) -> Tick {
        let reconnected = self.ever_connected;
        self.first_frame_deadline = None;
        self.ever_connected = true;
        self.attempts = 0;
        self.last_frame_at = Some(frame.timestamp);
        self.set_state(ConnectionState::Connected);
        if reconnected {
            self.status.update(|s| s.reconnects += 1);
        }

        info!(camera = %self.camera, reconnected, "Stream healthy");
        self.events.emit(RecorderEvent::CameraConnected {
            camera: self.camera.clone(),
            reconnected,
        });

        Tick::Connected { frame, reconnected }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.set_state(state);
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, Step};

    fn policy() -> SupervisorPolicy {
        SupervisorPolicy {
            reconnect_delay: Duration::from_millis(20),
            staleness_window: Duration::from_millis(60),
            read_timeout: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(10),
            error_pause: Duration::from_millis(5),
        }
    }

    fn supervisor(connector: ScriptedConnector) -> (ReconnectSupervisor, flume::Receiver<RecorderEvent>) {
        let (events, rx) = EventLog::channel();
        let status = Arc::new(StatusEntry::new("front"));
        (
            ReconnectSupervisor::new("front", "test://front", Arc::new(connector), policy(), events, status),
            rx,
        )
    }

    #[test]
    fn first_connect_needs_open_and_frame() {
        let connector = ScriptedConnector::new(vec![
            vec![Step::Frame, Step::Frame],
        ]);
        let (mut sup, events) = supervisor(connector);
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        assert!(matches!(sup.tick(), Tick::Connected { reconnected: false, .. }));
        assert!(sup.is_connected());
        assert!(matches!(sup.tick(), Tick::Frame(_)));
        assert_eq!(
            events.try_recv().unwrap(),
            RecorderEvent::CameraConnected {
                camera: "front".into(),
                reconnected: false
            }
        );
    }

    #[test]
    fn failed_first_open_backs_off_and_retries() {
        let connector = ScriptedConnector::new(vec![vec![Step::Frame]]).refuse_first(2);
        let (mut sup, events) = supervisor(connector);

        assert!(matches!(sup.tick(), Tick::Backoff(d) if d == Duration::from_millis(20)));
        assert!(matches!(sup.tick(), Tick::Backoff(_)));
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert!(matches!(sup.tick(), Tick::Connected { reconnected: false, .. }));

        let kinds: Vec<_> = events.try_iter().collect();
        assert!(matches!(kinds[0], RecorderEvent::Error { .. }));
        assert!(matches!(kinds[1], RecorderEvent::ReconnectAttempt { .. }));
        // Still the first successful connection
        assert!(kinds.contains(&RecorderEvent::CameraConnected {
            camera: "front".into(),
            reconnected: false
        }));
    }

    #[test]
    fn goes_stale_then_reconnects() {
        let connector = ScriptedConnector::new(vec![
            vec![Step::Frame, Step::Fail, Step::Fail],
            vec![Step::Frame],
        ]);
        let (mut sup, events) = supervisor(connector);

        assert!(matches!(sup.tick(), Tick::Connected { .. }));
        // Errors inside the staleness window only ask for a pause
        assert!(matches!(sup.tick(), Tick::Idle(d) if d == Duration::from_millis(5)));

        std::thread::sleep(Duration::from_millis(80));
        let Tick::Disconnected { last_frame_at, backoff } = sup.tick() else {
            panic!("expected disconnect");
        };
        assert!(last_frame_at.is_some());
        assert_eq!(backoff, Duration::from_millis(20));
        assert_eq!(sup.state(), ConnectionState::Stale);

        assert!(matches!(sup.tick(), Tick::Connected { reconnected: true, .. }));
        assert_eq!(sup.state(), ConnectionState::Connected);

        let all: Vec<_> = events.try_iter().collect();
        assert!(all.contains(&RecorderEvent::CameraDisconnected { camera: "front".into() }));
        assert!(all.contains(&RecorderEvent::ReconnectAttempt { camera: "front".into() }));
        assert!(all.contains(&RecorderEvent::CameraConnected {
            camera: "front".into(),
            reconnected: true
        }));
    }

    #[test]
    fn open_without_frame_is_not_a_connection() {
        let connector = ScriptedConnector::new(vec![vec![Step::EndOfStream], vec![Step::Frame]]);
        let (mut sup, _events) = supervisor(connector);

        assert!(matches!(sup.tick(), Tick::Backoff(_)));
        assert!(!sup.is_connected());
        assert!(matches!(sup.tick(), Tick::Connected { reconnected: false, .. }));
    }

    #[test]
    fn slow_first_frame_is_awaited_one_read_at_a_time() {
        let connector = ScriptedConnector::new(vec![vec![Step::FrameAfter(Duration::from_millis(35))]]);
        let (mut sup, _events) = supervisor(connector);

        let mut idle_ticks = 0;
        loop {
            let started = Instant::now();
            let tick = sup.tick();
            assert!(started.elapsed() < Duration::from_millis(40), "tick took {:?}", started.elapsed());
            match tick {
                Tick::Idle(d) => {
                    assert_eq!(d, Duration::ZERO);
                    assert_eq!(sup.state(), ConnectionState::Disconnected);
                    idle_ticks += 1;
                }
                Tick::Connected { reconnected: false, .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(idle_ticks >= 2);
        assert!(sup.is_connected());
    }

    #[test]
    fn silent_stream_is_abandoned_at_the_staleness_window() {
        let connector = ScriptedConnector::new(vec![vec![Step::FrameAfter(Duration::from_secs(60))]]);
        let (mut sup, events) = supervisor(connector);

        let started = Instant::now();
        let backoff = loop {
            match sup.tick() {
                Tick::Idle(_) => assert!(started.elapsed() < Duration::from_secs(1)),
                Tick::Backoff(d) => break d,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(backoff, Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(!sup.is_connected());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, RecorderEvent::Error { ref message, .. } if message.starts_with("Stream opened but no frame"))));
    }
}
