pub mod chunk;
pub mod chunk_index;
pub mod orchestrator;
pub mod paced_writer;
pub mod sink;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_sink;

pub use chunk::{ChunkDescriptor, ChunkPolicy, ChunkRecorder};
pub use chunk_index::ChunkIndexStore;
pub use orchestrator::{RecordingOrchestrator, ViewerFeed};
pub use paced_writer::{PacedWriter, WriterContext, WriterOptions, WriterStats};
pub use sink::{factory_for, MediaSink, MjpegFileSink, MjpegSinkFactory, SinkFactory, SinkParams};
