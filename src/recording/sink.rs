//! Output file backends

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::jpeg;
use crate::error::SinkError;

/// Encoding parameters for one output file
#[derive(Debug, Clone, PartialEq)]
pub struct SinkParams {
    /// FourCC-style codec name, e.g. `MJPG`
    pub codec: String,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    /// Format of the frames that will be written
    pub format: PixelFormat,
}

/// An open output file
pub trait MediaSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and close. Called exactly once.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Creates [`MediaSink`]s for a container format
pub trait SinkFactory: Send + Sync {
    /// File extension of the container, without the dot
    fn extension(&self) -> &str;

    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn MediaSink>, SinkError>;
}

/// Concatenated JPEG frames (MJPEG elementary stream).
///
/// Plays directly with `ffplay -f mjpeg -framerate <fps> file.mjpeg`.
pub struct MjpegFileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    quality: u8,
    /// Last encoded frame; padding repeats reuse it
    last_encoded: Option<(Arc<FrameMetadata>, Vec<u8>)>,
    frames_encoded: u64,
    frames_written: u64,
    bytes_written: u64,
}

impl MjpegFileSink {
    pub const CODEC: &'static str = "MJPG";
    pub const EXTENSION: &'static str = "mjpeg";

    pub fn create(path: &Path, params: &SinkParams, quality: u8) -> Result<Self, SinkError> {
        if !params.codec.eq_ignore_ascii_case(Self::CODEC) {
            return Err(SinkError::InvalidParams(format!(
                "codec `{}` cannot be written to .{} files",
                params.codec,
                Self::EXTENSION
            )));
        }
        if params.width == 0 || params.height == 0 {
            return Err(SinkError::InvalidParams(format!(
                "frame size {}x{}",
                params.width, params.height
            )));
        }

        // Never clobber an existing chunk
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| SinkError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        info!(path = %path.display(), fps = params.frame_rate, "Output sink opened");

        Ok(Self {
            writer: BufWriter::with_capacity(1024 * 1024, file),
            path: path.to_path_buf(),
            width: params.width,
            height: params.height,
            quality,
            last_encoded: None,
            frames_encoded: 0,
            frames_written: 0,
            bytes_written: 0,
        })
    }
}

impl MediaSink for MjpegFileSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let write_err = |source| SinkError::Write {
            path: self.path.clone(),
            source,
        };

        match frame.meta.format {
            PixelFormat::Mjpeg => {
                self.writer.write_all(&frame.data).map_err(write_err)?;
                self.bytes_written += frame.data.len() as u64;
            }
            format => {
                let repeat = self
                    .last_encoded
                    .as_ref()
                    .is_some_and(|(meta, _)| Arc::ptr_eq(meta, &frame.meta));
                if !repeat {
                    let (width, height) = frame.size();
                    if (width, height) != (self.width, self.height) {
                        debug!(
                            "Frame size {}x{} differs from sink {}x{}",
                            width, height, self.width, self.height
                        );
                    }
                    let encoded = jpeg::encode_frame(
                        &frame.data,
                        width,
                        height,
                        frame.meta.stride,
                        format,
                        self.quality,
                    )?;
                    self.frames_encoded += 1;
                    self.last_encoded = Some((frame.meta.clone(), encoded));
                }

                if let Some((_, encoded)) = &self.last_encoded {
                    self.writer.write_all(encoded).map_err(write_err)?;
                    self.bytes_written += encoded.len() as u64;
                }
            }
        }

        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let close_err = |source| SinkError::Write {
            path: self.path.clone(),
            source,
        };
        self.writer.flush().map_err(close_err)?;
        self.writer.get_ref().sync_all().map_err(close_err)?;

        info!(
            path = %self.path.display(),
            frames = self.frames_written,
            encoded = self.frames_encoded,
            bytes_kb = self.bytes_written / 1024,
            "Output sink closed"
        );
        Ok(())
    }
}

/// Factory for [`MjpegFileSink`]
#[derive(Debug, Clone)]
pub struct MjpegSinkFactory {
    pub quality: u8,
}

impl Default for MjpegSinkFactory {
    fn default() -> Self {
        Self {
            quality: jpeg::DEFAULT_QUALITY,
        }
    }
}

impl SinkFactory for MjpegSinkFactory {
    fn extension(&self) -> &str {
        MjpegFileSink::EXTENSION
    }

    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn MediaSink>, SinkError> {
        Ok(Box::new(MjpegFileSink::create(path, params, self.quality)?))
    }
}

/// Pick the sink backend for a container extension
pub fn factory_for(container: &str) -> Result<Arc<dyn SinkFactory>, SinkError> {
    if container.eq_ignore_ascii_case(MjpegFileSink::EXTENSION) {
        return Ok(Arc::new(MjpegSinkFactory::default()));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    return Ok(Arc::new(super::gst_sink::GstSinkFactory::new(container)?));

    #[cfg(not(feature = "gstreamer-pipeline"))]
    return Err(SinkError::InvalidParams(format!(
        "container `{}` requires the gstreamer-pipeline feature",
        container
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn params(codec: &str) -> SinkParams {
        SinkParams {
            codec: codec.into(),
            frame_rate: 25.0,
            width: 8,
            height: 8,
            format: PixelFormat::Rgb24,
        }
    }

    #[test]
    fn writes_jpeg_stream_and_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("front_20240101_000000_0.mjpeg");
        let factory = MjpegSinkFactory::default();

        let mut sink = factory.open(&path, &params("MJPG")).unwrap();
        let frame = Frame::new(
            vec![200u8; 8 * 8 * 3],
            FrameMetadata::new(8, 8, PixelFormat::Rgb24),
            Instant::now(),
        );
        sink.write(&frame).unwrap();
        sink.write(&frame).unwrap();
        sink.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let soi = bytes.windows(2).filter(|w| w[0] == 0xFF && w[1] == 0xD8).count();
        assert!(soi >= 2);

        assert!(matches!(
            factory.open(&path, &params("MJPG")),
            Err(SinkError::Create { .. })
        ));
    }

    #[test]
    fn rejects_foreign_codec() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.mjpeg");
        assert!(matches!(
            MjpegSinkFactory::default().open(&path, &params("H264")),
            Err(SinkError::InvalidParams(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn mjpeg_container_is_built_in() {
        assert_eq!(factory_for("mjpeg").unwrap().extension(), "mjpeg");
    }

    #[test]
    fn repeated_frames_are_encoded_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("front_20240101_000000_1.mjpeg");
        let mut sink = MjpegFileSink::create(&path, &params("MJPG"), jpeg::DEFAULT_QUALITY).unwrap();

        let still = Frame::new(
            vec![40u8; 8 * 8 * 3],
            FrameMetadata::new(8, 8, PixelFormat::Rgb24),
            Instant::now(),
        );
        // A stall: the same frame padded out several times
        for _ in 0..5 {
            sink.write(&still.clone()).unwrap();
        }
        let next = Frame::new(
            vec![220u8; 8 * 8 * 3],
            FrameMetadata::new(8, 8, PixelFormat::Rgb24),
            Instant::now(),
        );
        sink.write(&next).unwrap();
        sink.close().unwrap();

        assert_eq!(sink.frames_written, 6);
        assert_eq!(sink.frames_encoded, 2);
        let bytes = std::fs::read(&path).unwrap();
        let soi = bytes.windows(2).filter(|w| w[0] == 0xFF && w[1] == 0xD8).count();
        assert!(soi >= 6);
    }
}
