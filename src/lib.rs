pub mod capture;
pub mod display;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod recording;
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use error::{ConnectError, RecorderError, SinkError, StreamError};
pub use events::{EventLog, RecorderEvent};
pub use pipeline::status::{CameraStatus, ConnectionState, StatusBoard};
pub use recording::orchestrator::RecordingOrchestrator;

/// Environment variables prefixed with this override file settings,
/// e.g. `VIGIL__RECORDING__CHUNK_DURATION_SECS=300`
pub const ENV_PREFIX: &str = "VIGIL";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recording: RecordingConfig,
    pub supervisor: SupervisorConfig,
    pub writer: WriterConfig,
    pub viewer: ViewerConfig,
    pub logging: LoggingConfig,
    pub cameras: Vec<CameraSpec>,
}

/// One camera; immutable once the fleet is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub name: String,
    pub url: String,
    /// Output frame rate; the source's reported rate when absent
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Output size; the first frame's size when absent
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl CameraSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            frame_rate: None,
            width: None,
            height: None,
        }
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub chunk_duration_secs: u64,
    /// Codec handed to the sink, FourCC style
    pub codec: String,
    /// Container, also the file extension
    pub container: String,
    /// Start recording as soon as the fleet is launched
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Fixed wait between reconnect attempts; no growth, no attempt cap
    pub reconnect_delay_ms: u64,
    /// Defaults to the reconnect delay
    pub staleness_window_ms: Option<u64>,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pause after a read error that returned immediately
    pub error_pause_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub max_buffer_size: usize,
    pub fallback_frame_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub handoff_capacity: usize,
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            supervisor: SupervisorConfig::default(),
            writer: WriterConfig::default(),
            viewer: ViewerConfig::default(),
            logging: LoggingConfig::default(),
            cameras: vec![
                CameraSpec::new("front", "test://front?fps=20"),
                CameraSpec::new("rear", "test://rear?fps=20"),
            ],
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            chunk_duration_secs: 60,
            codec: "MJPG".into(),
            container: "mjpeg".into(),
            autostart: true,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            staleness_window_ms: None,
            read_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
            error_pause_ms: 100,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: recording::paced_writer::DEFAULT_MAX_BUFFER_SIZE,
            fallback_frame_rate: recording::paced_writer::DEFAULT_FALLBACK_FRAME_RATE,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            handoff_capacity: 5,
            status_interval_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            filter: "vigil=info".into(),
        }
    }
}

impl RecordingConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(self.chunk_duration_secs)
    }
}

impl SupervisorConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms.unwrap_or(self.reconnect_delay_ms))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.error_pause_ms)
    }
}

impl Config {
    /// Defaults, then the TOML file (`path`, or `./vigil.toml` if it exists),
    /// then `VIGIL__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, RecorderError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("vigil").required(false));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        let invalid = |msg: String| Err(RecorderError::Config(msg));

        if self.cameras.is_empty() {
            return invalid("at least one camera is required".into());
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            let name = camera.name.as_str();
            if name.is_empty()
                || name.contains(['/', '\\', '.'])
                || name.chars().any(char::is_whitespace)
            {
                return invalid(format!("camera name `{}` is not a valid file name prefix", name));
            }
            if !seen.insert(name) {
                return invalid(format!("camera name `{}` is used twice", name));
            }
            if camera.url.is_empty() {
                return invalid(format!("camera `{}` has no url", name));
            }
            if let Some(rate) = camera.frame_rate {
                if !(rate.is_finite() && rate > 0.0) {
                    return invalid(format!("camera `{}` frame_rate must be positive", name));
                }
            }
            if camera.width.is_some() != camera.height.is_some() {
                return invalid(format!("camera `{}` needs both width and height", name));
            }
        }

        if self.recording.chunk_duration_secs == 0 {
            return invalid("recording.chunk_duration_secs must be positive".into());
        }
        if self.recording.container.is_empty() || self.recording.container.contains('.') {
            return invalid(format!("bad container `{}`", self.recording.container));
        }
        if self.writer.max_buffer_size == 0 {
            return invalid("writer.max_buffer_size must be at least 1".into());
        }
        if !(self.writer.fallback_frame_rate.is_finite() && self.writer.fallback_frame_rate > 0.0) {
            return invalid("writer.fallback_frame_rate must be positive".into());
        }
        if self.supervisor.reconnect_delay_ms == 0 || self.supervisor.read_timeout_ms == 0 {
            return invalid("supervisor delays must be positive".into());
        }
        if self.viewer.handoff_capacity == 0 {
            return invalid("viewer.handoff_capacity must be at least 1".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_recorder_behaviour() {
        let config = Config::default();
        assert_eq!(config.recording.chunk_duration(), Duration::from_secs(60));
        assert_eq!(config.supervisor.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.supervisor.staleness_window(), Duration::from_secs(5));
        assert_eq!(config.writer.max_buffer_size, 25);
        assert_eq!(config.viewer.handoff_capacity, 5);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_and_unsafe_names() {
        let mut config = Config::default();
        config.cameras[1].name = "front".into();
        assert!(matches!(config.validate(), Err(RecorderError::Config(_))));

        config.cameras[1].name = "../rear".into();
        assert!(config.validate().is_err());

        config.cameras.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            r#"
[recording]
chunk_duration_secs = 120
container = "avi"

[supervisor]
reconnect_delay_ms = 2000

[[cameras]]
name = "gate"
url = "rtsp://10.0.0.7/stream1"
frame_rate = 25.0
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.recording.chunk_duration_secs, 120);
        assert_eq!(config.recording.container, "avi");
        // Untouched keys keep their defaults
        assert_eq!(config.recording.codec, "MJPG");
        assert_eq!(config.supervisor.staleness_window(), Duration::from_secs(2));
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].frame_rate, Some(25.0));
        assert_eq!(config.cameras[0].frame_size(), None);
    }
}
