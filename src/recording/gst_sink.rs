//! GStreamer encoding sink: appsrc → encoder → muxer → filesink

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::SinkError;
use crate::recording::sink::{MediaSink, SinkFactory, SinkParams};

pub struct GstSinkFactory {
    extension: String,
    muxer: &'static str,
}

impl GstSinkFactory {
    pub fn new(container: &str) -> Result<Self, SinkError> {
        gst::init().map_err(|e| SinkError::Backend(format!("Failed to initialize GStreamer: {}", e)))?;

        let muxer = Self::muxer_for(container).ok_or_else(|| {
            SinkError::InvalidParams(format!("no muxer for container `{}`", container))
        })?;

        Ok(Self {
            extension: container.to_ascii_lowercase(),
            muxer,
        })
    }

    fn muxer_for(container: &str) -> Option<&'static str> {
        match container.to_ascii_lowercase().as_str() {
            "avi" => Some("avimux"),
            "mkv" => Some("matroskamux"),
            "mp4" => Some("mp4mux"),
            "mov" => Some("qtmux"),
            _ => None,
        }
    }

    fn encoder_for(codec: &str) -> Option<&'static str> {
        match codec.to_ascii_uppercase().as_str() {
            "MJPG" => Some("jpegenc"),
            "H264" | "X264" | "AVC1" => Some("x264enc tune=zerolatency speed-preset=veryfast"),
            "VP80" | "VP8" => Some("vp8enc deadline=1"),
            _ => None,
        }
    }

    /// Caps for the appsrc, matching what the pipeline will push
    fn input_caps(params: &SinkParams) -> Result<gst::Caps, SinkError> {
        let fps = rate_fraction(params.frame_rate);
        match params.format {
            PixelFormat::Mjpeg => Ok(gst::Caps::builder("image/jpeg")
                .field("width", params.width as i32)
                .field("height", params.height as i32)
                .field("framerate", fps)
                .build()),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let format = if params.format == PixelFormat::Rgb24 {
                    gst_video::VideoFormat::Rgb
                } else {
                    gst_video::VideoFormat::Bgr
                };
                gst_video::VideoInfo::builder(format, params.width, params.height)
                    .fps(fps)
                    .build()
                    .and_then(|info| info.to_caps())
                    .map_err(|e| SinkError::InvalidParams(e.to_string()))
            }
        }
    }

    fn build_pipeline_string(&self, path: &Path, params: &SinkParams) -> Result<String, SinkError> {
        let encoder = Self::encoder_for(&params.codec)
            .ok_or_else(|| SinkError::InvalidParams(format!("unknown codec `{}`", params.codec)))?;
        let decode = if params.format == PixelFormat::Mjpeg {
            "jpegdec ! "
        } else {
            ""
        };

        Ok(format!(
            "appsrc name=src is-live=false format=time ! \
             {}videoconvert ! \
             {} ! \
             {} ! \
             filesink location=\"{}\"",
            decode,
            encoder,
            self.muxer,
            path.display()
        ))
    }
}

impl SinkFactory for GstSinkFactory {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn MediaSink>, SinkError> {
        Ok(Box::new(self.open_sink(path, params)?))
    }
}

impl GstSinkFactory {
    fn open_sink(&self, path: &Path, params: &SinkParams) -> Result<GstMediaSink, SinkError> {
        if path.exists() {
            return Err(SinkError::Create {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            });
        }

        let pipeline_str = self.build_pipeline_string(path, params)?;
        debug!("Pipeline: {}", pipeline_str);

        let backend = |e: String| SinkError::Backend(e);
        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| backend(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| backend("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| backend("Failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| backend("Failed to cast to AppSrc".into()))?;
        appsrc.set_caps(Some(&Self::input_caps(params)?));
        appsrc.set_format(gst::Format::Time);

        pipeline.set_state(gst::State::Playing).map_err(|e| SinkError::Create {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{:?}", e)),
        })?;

        info!(path = %path.display(), codec = %params.codec, "Encoding sink opened");

        let frame_duration = gst::ClockTime::from_nseconds((1e9 / params.frame_rate) as u64);
        Ok(GstMediaSink {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            frame_duration,
            frames_written: 0,
        })
    }
}

fn rate_fraction(rate: f64) -> gst::Fraction {
    // Millihertz precision covers 29.97 and friends
    gst::Fraction::new((rate * 1000.0).round() as i32, 1000)
}

pub struct GstMediaSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    frame_duration: gst::ClockTime,
    frames_written: u64,
}

impl MediaSink for GstMediaSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(self.frame_duration * self.frames_written);
            buffer.set_duration(self.frame_duration);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| SinkError::Write {
                path: self.path.clone(),
                source: std::io::Error::other(format!("{:?}", e)),
            })?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!(path = %self.path.display(), "Failed to send EOS: {:?}", e);
        }

        let mut result = Ok(());
        if let Some(bus) = self.pipeline.bus() {
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(10),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            match msg.as_ref().map(|m| m.view()) {
                Some(gst::MessageView::Eos(..)) => {}
                Some(gst::MessageView::Error(err)) => {
                    result = Err(SinkError::Backend(err.error().to_string()));
                }
                _ => warn!(path = %self.path.display(), "Timed out waiting for EOS"),
            }
        }

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }

        info!(path = %self.path.display(), frames = self.frames_written, "Encoding sink closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_codecs_and_containers() {
        assert_eq!(GstSinkFactory::muxer_for("AVI"), Some("avimux"));
        assert_eq!(GstSinkFactory::muxer_for("webm"), None);
        assert_eq!(GstSinkFactory::encoder_for("mjpg"), Some("jpegenc"));
        assert!(GstSinkFactory::encoder_for("HEVC").is_none());
    }

    #[test]
    fn close_survives_a_refused_eos() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("front_20240101_000000_0.mkv");
        let params = SinkParams {
            codec: "MJPG".into(),
            frame_rate: 10.0,
            width: 8,
            height: 8,
            format: PixelFormat::Mjpeg,
        };
        let mut sink = GstSinkFactory::new("mkv").unwrap().open_sink(&path, &params).unwrap();

        let jpeg = crate::capture::jpeg::encode_frame(&[90u8; 8 * 8 * 3], 8, 8, 8 * 3, PixelFormat::Rgb24, 85).unwrap();
        let frame = Frame::new(jpeg, crate::capture::frame::FrameMetadata::new(8, 8, PixelFormat::Mjpeg), std::time::Instant::now());
        sink.write(&frame).unwrap();

        // appsrc refuses the second EOS sent by close
        sink.appsrc.end_of_stream().unwrap();
        sink.close().unwrap();
        assert!(path.exists());
    }
}
