use crate::actuators::Actuators;
use crate::error::CameraError;
use crate::frame::Frame;
use chrono::Utc;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// An open camera device producing raw frames in sensor order
pub trait CameraDevice: Send {
    fn read_frame(&mut self) -> Result<DynamicImage, CameraError>;

    /// Stop streaming and free the device; must be safe to call more than once
    fn release(&mut self);
}

/// Opens the underlying device; one device handle per capture cycle
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn CameraDevice>, CameraError>;

    /// Human readable device label for logs
    fn describe(&self) -> String;
}

/// Ordered frame capture over an exclusively owned camera device.
///
/// Opening is blocking and is expected to run on the blocking pool.
#[derive(Clone)]
pub struct FrameSource {
    opener: Arc<dyn CameraOpener>,
    actuators: Arc<dyn Actuators>,
    warm_up_frames: u32,
}

impl FrameSource {
    pub fn new(
        opener: Arc<dyn CameraOpener>,
        actuators: Arc<dyn Actuators>,
        warm_up_frames: u32,
    ) -> Self {
        Self {
            opener,
            actuators,
            warm_up_frames,
        }
    }

    /// Open the camera, switching illumination on first when `night` is set.
    ///
    /// Illumination is switched back off on every failure path because the
    /// guard is created before the device is opened.
    pub fn open(&self, night: bool) -> Result<CameraSession, CameraError> {
        let illumination = IlluminationGuard::engage(Arc::clone(&self.actuators), night);

        debug!(
            "Opening camera {} ({} mode)",
            self.opener.describe(),
            if night { "night" } else { "day" }
        );
        let device = self.opener.open()?;

        let mut session = CameraSession {
            device: Some(device),
            night,
            last_timestamp_ms: 0,
            _illumination: illumination,
        };

        for _ in 0..self.warm_up_frames {
            session.read_raw()?;
        }
        trace!("Discarded {} warm-up frames", self.warm_up_frames);

        Ok(session)
    }

    pub fn describe(&self) -> String {
        self.opener.describe()
    }
}

/// Holds the illuminator on for the lifetime of a night session
struct IlluminationGuard {
    actuators: Arc<dyn Actuators>,
    lit: bool,
}

impl IlluminationGuard {
    fn engage(actuators: Arc<dyn Actuators>, night: bool) -> Self {
        if let Err(e) = actuators.set_optical_filter(night) {
            warn!("Failed to switch optical filter: {}", e);
        }

        let lit = if night {
            match actuators.set_illumination(true) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to switch illumination on: {}", e);
                    // Still attempt the switch-off on drop
                    true
                }
            }
        } else {
            false
        };

        Self { actuators, lit }
    }
}

impl Drop for IlluminationGuard {
    fn drop(&mut self) {
        if self.lit {
            if let Err(e) = self.actuators.set_illumination(false) {
                warn!("Failed to switch illumination off: {}", e);
            }
        }
    }
}

/// An open camera; dropping it releases the device and switches illumination off
pub struct CameraSession {
    device: Option<Box<dyn CameraDevice>>,
    night: bool,
    // Frame timestamps are file names and must be strictly increasing
    last_timestamp_ms: i64,
    // Dropped after the device is released
    _illumination: IlluminationGuard,
}

impl CameraSession {
    fn read_raw(&mut self) -> Result<DynamicImage, CameraError> {
        match self.device.as_mut() {
            Some(device) => device.read_frame(),
            None => Err(CameraError::ReadFailed {
                details: "camera session already closed".to_string(),
            }),
        }
    }

    /// Capture `n` frames in order, skipping `frames_per_sec - 1` sensor
    /// frames after each retained one. Night frames are grayscale.
    pub fn capture_n(&mut self, n: u32, frames_per_sec: u32) -> Result<Vec<Frame>, CameraError> {
        let skip = frames_per_sec.saturating_sub(1);
        let mut frames = Vec::with_capacity(n as usize);

        for _ in 0..n {
            let image = self.read_raw()?;
            let timestamp_ms = Utc::now()
                .timestamp_millis()
                .max(self.last_timestamp_ms + 1);
            self.last_timestamp_ms = timestamp_ms;
            let frame = Frame::new(timestamp_ms, image);
            frames.push(if self.night {
                frame.into_grayscale()
            } else {
                frame
            });

            for _ in 0..skip {
                self.read_raw()?;
            }
        }

        trace!("Captured {} frames", frames.len());
        Ok(frames)
    }

    pub fn is_night(&self) -> bool {
        self.night
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            debug!("Camera released");
        }
    }
}
