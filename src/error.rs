//! Error taxonomy for the recording pipeline.
//!
//! Each error is scoped to the layer that can act on it: connection errors are
//! retried by the supervisor, stream errors feed staleness detection, sink
//! errors end the current chunk only. [`RecorderError`] covers what is fatal at
//! startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Opening a camera stream failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unsupported stream url `{0}`")]
    UnsupportedUrl(String),

    #[error("failed to open `{url}`: {reason}")]
    Open { url: String, reason: String },

    #[error("timed out connecting to `{0}`")]
    Timeout(String),
}

/// A read from an open stream failed.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no frame within read timeout")]
    Timeout,

    #[error("end of stream")]
    EndOfStream,

    #[error("stream is closed")]
    Closed,

    #[error("stream read failed: {0}")]
    Failed(String),
}

/// Creating, writing or closing an output file failed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write to {} failed: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid sink parameters: {0}")]
    InvalidParams(String),

    #[error("unsupported frame format {0}")]
    UnsupportedFormat(String),

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("media backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the orchestrator and configuration layer.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigSource(#[from] config::ConfigError),

    #[error("cannot prepare {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot scan {} for chunk indices: {source}", path.display())]
    Index {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
