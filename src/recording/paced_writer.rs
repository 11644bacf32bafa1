//! Fixed-rate output from irregular input.
//!
//! A [`PacedWriter`] owns one output file. Frames are submitted with their
//! arrival time into a small drop-oldest backlog; a drain thread keeps a
//! virtual output clock and writes each frame as many times as it takes for
//! the clock to reach the frame's arrival. Slow sources are therefore padded
//! with repeats of their last frame and fast sources are thinned out, so the
//! file always plays back at its nominal rate with no gaps.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use metrics::Counter;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::SinkError;
use crate::events::EventLog;
use crate::pipeline::handoff::{handoff, HandoffReceiver, HandoffSender};
use crate::recording::sink::{MediaSink, SinkFactory, SinkParams};

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 25;
pub const DEFAULT_FALLBACK_FRAME_RATE: f64 = 30.0;

/// Tunables shared by every writer of a camera
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    pub codec: String,
    pub max_buffer_size: usize,
    pub fallback_frame_rate: f64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            codec: "MJPG".into(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            fallback_frame_rate: DEFAULT_FALLBACK_FRAME_RATE,
        }
    }
}

/// Everything a camera needs to open writers
#[derive(Clone)]
pub struct WriterContext {
    pub camera: String,
    pub sinks: Arc<dyn SinkFactory>,
    pub options: WriterOptions,
    pub events: EventLog,
}

/// Counters for one finished file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Frames taken off the backlog
    pub received: u64,
    /// Frames written to the file, repeats included
    pub written: u64,
    /// Writes that repeated an already written frame
    pub duplicated: u64,
    /// Frames consumed without being written because the clock was ahead
    pub skipped: u64,
    /// Frames evicted from a full backlog
    pub dropped: u64,
    pub failed: bool,
}

/// Output clock advancing in whole frame intervals from a fixed origin
#[derive(Debug, Clone)]
pub struct VirtualClock {
    origin: Instant,
    interval_ns: u64,
    ticks: u64,
}

impl VirtualClock {
    pub fn new(origin: Instant, frame_rate: f64) -> Self {
        let interval_ns = ((1e9 / frame_rate).round() as u64).max(1);
        Self {
            origin,
            interval_ns,
            ticks: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns)
    }

    pub fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.interval_ns.saturating_mul(self.ticks))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance while the clock is behind `until`; returns how many frames that
    /// takes (0 when the clock is already there).
    pub fn advance_to(&mut self, until: Instant) -> u64 {
        let elapsed = until.saturating_duration_since(self.origin).as_nanos();
        let interval = u128::from(self.interval_ns);
        // Number of ticks k with origin + k * interval < until
        let target = ((elapsed + interval - 1) / interval).min(u128::from(u64::MAX)) as u64;
        let due = target.saturating_sub(self.ticks);
        self.ticks = self.ticks.max(target);
        due
    }
}

/// Pick a usable output rate; the bool is true when the fallback was used
pub fn resolve_frame_rate(requested: Option<f64>, fallback: f64) -> (f64, bool) {
    match requested {
        Some(rate) if rate.is_finite() && rate > 0.0 => (rate, false),
        _ => (fallback, true),
    }
}

enum Pending {
    Frame(Frame, Instant),
    Finish(Instant),
}

pub struct PacedWriter {
    camera: String,
    path: PathBuf,
    frame_rate: f64,
    backlog: Mutex<Option<HandoffSender<Pending>>>,
    worker: Mutex<Option<JoinHandle<WriterStats>>>,
    failed: Arc<AtomicBool>,
}

impl PacedWriter {
    /// Create the output file and start the drain thread. The virtual clock
    /// starts at `clock_origin`.
    #[instrument(skip(ctx, clock_origin), fields(camera = %ctx.camera))]
    pub fn open(
        ctx: &WriterContext,
        path: &Path,
        frame_rate: Option<f64>,
        frame_size: (u32, u32),
        format: PixelFormat,
        clock_origin: Instant,
    ) -> Result<Self, SinkError> {
        let (frame_rate, fallback) =
            resolve_frame_rate(frame_rate, ctx.options.fallback_frame_rate);
        if fallback {
            ctx.events.warning(
                &ctx.camera,
                format!("Invalid FPS value. Using default value of {}.", frame_rate),
            );
        }

        let params = SinkParams {
            codec: ctx.options.codec.clone(),
            frame_rate,
            width: frame_size.0,
            height: frame_size.1,
            format,
        };
        let sink = ctx.sinks.open(path, &params)?;

        let (tx, rx) = handoff(ctx.options.max_buffer_size);
        let failed = Arc::new(AtomicBool::new(false));
        let drain = Drain {
            camera: ctx.camera.clone(),
            path: path.to_path_buf(),
            sink,
            clock: VirtualClock::new(clock_origin, frame_rate),
            last: None,
            stats: WriterStats::default(),
            written_total: metrics::counter!("vigil_frames_written_total", "camera" => ctx.camera.clone()),
            duplicated_total: metrics::counter!("vigil_frames_duplicated_total", "camera" => ctx.camera.clone()),
        };

        let events = ctx.events.clone();
        let worker_failed = failed.clone();
        let worker = std::thread::Builder::new()
            .name(format!("writer-{}", ctx.camera))
            .spawn(move || drain.run(rx, &events, &worker_failed))
            .map_err(|e| SinkError::Backend(format!("failed to spawn writer thread: {}", e)))?;

        debug!(fps = frame_rate, "Paced writer started");

        Ok(Self {
            camera: ctx.camera.clone(),
            path: path.to_path_buf(),
            frame_rate,
            backlog: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            failed,
        })
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn is_running(&self) -> bool {
        self.backlog.lock().is_some() && !self.has_failed()
    }

    /// True once a write error ended this file
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Queue a frame. Never blocks; when the backlog is full the oldest queued
    /// frame is discarded. Does nothing once the writer is stopped or failed.
    pub fn submit(&self, frame: Frame, arrival: Instant) {
        if self.has_failed() {
            return;
        }
        if let Some(backlog) = self.backlog.lock().as_ref() {
            if backlog.push(Pending::Frame(frame, arrival)) {
                metrics::counter!("vigil_frames_dropped_total", "camera" => self.camera.clone())
                    .increment(1);
            }
        }
    }

    /// Stop at the current instant
    pub fn stop(&self) -> Option<WriterStats> {
        self.stop_at(Instant::now())
    }

    /// Drain the backlog, pad the last frame until the virtual clock reaches
    /// `end`, then flush and close the file.
    ///
    /// Blocks until the file is closed. Only the first call returns stats;
    /// later or concurrent calls wait for that close and return `None`.
    pub fn stop_at(&self, end: Instant) -> Option<WriterStats> {
        let mut worker = self.worker.lock();

        let backlog = self.backlog.lock().take();
        let dropped = match backlog {
            Some(tx) => {
                tx.push(Pending::Finish(end));
                tx.stats().dropped as u64
            }
            None => 0,
        };

        let handle = worker.take()?;
        let mut stats = match handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!(camera = %self.camera, path = %self.path.display(), "Writer thread panicked");
                self.failed.store(true, Ordering::Release);
                WriterStats {
                    failed: true,
                    ..WriterStats::default()
                }
            }
        };
        stats.dropped = dropped;

        info!(
            camera = %self.camera,
            path = %self.path.display(),
            written = stats.written,
            duplicated = stats.duplicated,
            dropped = stats.dropped,
            "Paced writer stopped"
        );
        Some(stats)
    }
}

impl Drop for PacedWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the drain thread
struct Drain {
    camera: String,
    path: PathBuf,
    sink: Box<dyn MediaSink>,
    clock: VirtualClock,
    last: Option<Frame>,
    stats: WriterStats,
    written_total: Counter,
    duplicated_total: Counter,
}

impl Drain {
    fn run(mut self, rx: HandoffReceiver<Pending>, events: &EventLog, failed: &AtomicBool) -> WriterStats {
        let pumped = self.pump(&rx);
        // Close regardless so whatever was written stays readable
        let closed = self.sink.close();

        if let Err(e) = pumped.and(closed) {
            failed.store(true, Ordering::Release);
            self.stats.failed = true;
            events.error(
                &self.camera,
                format!("Recording to {} failed: {}", self.path.display(), e),
            );
        }

        self.stats
    }

    fn pump(&mut self, rx: &HandoffReceiver<Pending>) -> Result<(), SinkError> {
        while let Some(pending) = rx.recv() {
            match pending {
                Pending::Frame(frame, arrival) => {
                    self.stats.received += 1;
                    let due = self.clock.advance_to(arrival);
                    if due == 0 {
                        self.stats.skipped += 1;
                    }
                    self.write_repeated(&frame, due, false)?;
                    self.last = Some(frame);
                }
                Pending::Finish(end) => {
                    if let Some(frame) = self.last.take() {
                        let due = self.clock.advance_to(end);
                        self.write_repeated(&frame, due, true)?;
                    }
                    return Ok(());
                }
            }
        }
        // Writer dropped without an explicit stop
        Ok(())
    }

    fn write_repeated(&mut self, frame: &Frame, times: u64, all_repeats: bool) -> Result<(), SinkError> {
        for i in 0..times {
            self.sink.write(frame)?;
            self.stats.written += 1;
            self.written_total.increment(1);
            if all_repeats || i > 0 {
                self.stats.duplicated += 1;
                self.duplicated_total.increment(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn clock_counts_intervals_before_arrival() {
        let t0 = Instant::now();
        let mut clock = VirtualClock::new(t0, 25.0);
        assert_eq!(clock.interval(), ms(40));

        // Arrival exactly at the origin needs nothing
        assert_eq!(clock.advance_to(t0), 0);
        // t = 0 < 1ms: one frame
        assert_eq!(clock.advance_to(t0 + ms(1)), 1);
        // t = 40 < 100 and 80 < 100: two more
        assert_eq!(clock.advance_to(t0 + ms(100)), 2);
        assert_eq!(clock.now(), t0 + ms(120));
        // Clock ahead of arrival: frame is skipped
        assert_eq!(clock.advance_to(t0 + ms(110)), 0);
        assert_eq!(clock.ticks(), 3);
    }

    #[test]
    fn stalls_are_filled() {
        let t0 = Instant::now();
        let mut clock = VirtualClock::new(t0, 25.0);
        clock.advance_to(t0 + ms(1000));
        // A 10s gap needs 250 repeats at 25fps
        assert_eq!(clock.advance_to(t0 + ms(11_000)), 250);
    }

    #[test]
    fn jittered_arrivals_match_nominal_count() {
        let t0 = Instant::now();
        for fps in [10.0, 24.0, 25.0, 29.97, 60.0] {
            let mut clock = VirtualClock::new(t0, fps);
            let mut written = 0;
            let mut t = 0u64;
            let mut seed = 7u64;
            while t < 30_000 {
                // Cheap LCG: 0-120ms gaps, bursts included
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                t += (seed >> 33) % 120;
                written += clock.advance_to(t0 + ms(t));
            }
            let expected = (t as f64 / 1000.0 * fps).floor() as i64;
            assert!(
                (written as i64 - expected).abs() <= 1,
                "fps {}: wrote {} expected {}",
                fps,
                written,
                expected
            );
        }
    }

    #[test]
    fn invalid_rates_fall_back() {
        assert_eq!(resolve_frame_rate(Some(25.0), 30.0), (25.0, false));
        assert_eq!(resolve_frame_rate(Some(0.0), 30.0), (30.0, true));
        assert_eq!(resolve_frame_rate(Some(-5.0), 30.0), (30.0, true));
        assert_eq!(resolve_frame_rate(Some(f64::NAN), 30.0), (30.0, true));
        assert_eq!(resolve_frame_rate(None, 30.0), (30.0, true));
    }
}
