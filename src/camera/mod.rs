#[cfg(all(target_os = "linux", feature = "camera"))]
mod pipeline;
mod mock;
mod source;

#[cfg(all(target_os = "linux", feature = "camera"))]
pub use pipeline::{build_pipeline_string, GstreamerCamera, GstreamerOpener};
pub use mock::{square_frame, SyntheticCamera, SyntheticOpener, SyntheticStats};
pub use source::{CameraDevice, CameraOpener, CameraSession, FrameSource};

use crate::config::{CameraBackend, CameraConfig};
use crate::error::CameraError;
use std::sync::Arc;

/// Build the configured camera opener
pub fn opener_from_config(config: &CameraConfig) -> Result<Arc<dyn CameraOpener>, CameraError> {
    match config.backend {
        #[cfg(all(target_os = "linux", feature = "camera"))]
        CameraBackend::Gstreamer => Ok(Arc::new(GstreamerOpener::new(config)?)),
        #[cfg(not(all(target_os = "linux", feature = "camera")))]
        CameraBackend::Gstreamer => Err(CameraError::Configuration {
            details: "GStreamer camera requires Linux and the `camera` feature".to_string(),
        }),
        CameraBackend::Synthetic => Ok(Arc::new(SyntheticOpener::still(
            config.resolution.0,
            config.resolution.1,
        ))),
    }
}
