use super::source::{CameraDevice, CameraOpener};
use crate::config::CameraConfig;
use crate::error::CameraError;
use image::{DynamicImage, RgbaImage};
use std::time::Duration;
use tracing::{debug, info, warn};

use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;

/// Build the capture pipeline description; the appsink must be named "sink"
/// and receive RGBA.
pub fn build_pipeline_string(config: &CameraConfig) -> String {
    if let Some(pipeline) = &config.pipeline {
        return pipeline.clone();
    }

    let (width, height) = config.resolution;
    let fps = config.fps;
    let sink = "appsink name=sink sync=false max-buffers=2 drop=false emit-signals=false";

    if config.source.starts_with("nvarguscamerasrc") {
        format!(
            "{} ! video/x-raw(memory:NVMM),width={},height={},framerate={}/1 ! \
             nvvidconv flip-method=0 ! video/x-raw,format=BGRx ! \
             videoconvert ! video/x-raw,format=RGBA ! {}",
            config.source, width, height, fps, sink
        )
    } else {
        format!(
            "{} ! videoconvert ! videoscale ! \
             video/x-raw,format=RGBA,width={},height={} ! {}",
            config.source, width, height, sink
        )
    }
}

/// Opens a fresh GStreamer pipeline per capture cycle
pub struct GstreamerOpener {
    pipeline_desc: String,
    device: String,
    read_timeout: Duration,
}

impl GstreamerOpener {
    pub fn new(config: &CameraConfig) -> Result<Self, CameraError> {
        gstreamer::init().map_err(|e| CameraError::Configuration {
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        let pipeline_desc = build_pipeline_string(config);
        info!("Camera pipeline: {}", pipeline_desc);

        Ok(Self {
            pipeline_desc,
            device: config.source.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        })
    }
}

impl CameraOpener for GstreamerOpener {
    fn open(&self) -> Result<Box<dyn CameraDevice>, CameraError> {
        let open_failed = |details: String| CameraError::OpenFailed {
            device: self.device.clone(),
            details,
        };

        let pipeline = gstreamer::parse::launch(&self.pipeline_desc)
            .map_err(|e| open_failed(format!("Failed to create pipeline: {}", e)))?
            .downcast::<Pipeline>()
            .map_err(|_| open_failed("Failed to downcast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_failed("Pipeline has no element named 'sink'".to_string()))?
            .downcast::<AppSink>()
            .map_err(|_| open_failed("Element 'sink' is not an appsink".to_string()))?;

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(open_failed(format!("Failed to start pipeline: {}", e)));
        }

        debug!("GStreamer pipeline playing");

        Ok(Box::new(GstreamerCamera {
            pipeline,
            appsink,
            read_timeout: self.read_timeout,
            released: false,
        }))
    }

    fn describe(&self) -> String {
        self.device.clone()
    }
}

pub struct GstreamerCamera {
    pipeline: Pipeline,
    appsink: AppSink,
    read_timeout: Duration,
    released: bool,
}

impl GstreamerCamera {
    fn sample_to_image(sample: &gstreamer::Sample) -> Result<DynamicImage, CameraError> {
        let buffer = sample.buffer().ok_or_else(|| CameraError::ReadFailed {
            details: "No buffer in sample".to_string(),
        })?;

        let caps = sample.caps().ok_or_else(|| CameraError::ReadFailed {
            details: "No caps in sample".to_string(),
        })?;

        let video_info = VideoInfo::from_caps(caps).map_err(|e| CameraError::ReadFailed {
            details: format!("Failed to get video info: {}", e),
        })?;

        let width = video_info.width();
        let height = video_info.height();
        let stride = video_info.stride()[0] as usize;
        let row_bytes = width as usize * 4;

        let map = buffer.map_readable().map_err(|e| CameraError::ReadFailed {
            details: format!("Failed to map buffer: {}", e),
        })?;
        let data = map.as_slice();

        if height == 0 || stride < row_bytes || data.len() < stride * (height as usize - 1) + row_bytes {
            return Err(CameraError::ReadFailed {
                details: format!(
                    "Buffer of {} bytes too small for {}x{} RGBA (stride {})",
                    data.len(),
                    width,
                    height,
                    stride
                ),
            });
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in data.chunks(stride).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes]);
        }

        let rgba = RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            CameraError::ReadFailed {
                details: "Frame buffer size mismatch".to_string(),
            }
        })?;

        Ok(DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8()))
    }
}

impl CameraDevice for GstreamerCamera {
    fn read_frame(&mut self) -> Result<DynamicImage, CameraError> {
        if self.released {
            return Err(CameraError::ReadFailed {
                details: "Camera already released".to_string(),
            });
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => Self::sample_to_image(&sample),
            None if self.appsink.is_eos() => Err(CameraError::ReadFailed {
                details: "Camera stream ended".to_string(),
            }),
            None => Err(CameraError::FrameTimeout {
                timeout: self.read_timeout,
            }),
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("Failed to stop GStreamer pipeline: {}", e);
        }
    }
}

impl Drop for GstreamerCamera {
    fn drop(&mut self) {
        self.release();
    }
}
