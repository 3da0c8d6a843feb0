mod calibration;
mod histogram;
mod motion;

pub use calibration::{pairwise_magnitudes, MagnitudeStats};
pub use histogram::{histogram, match_histogram, matching_lut, Histogram};
pub use motion::{frame_magnitude, MotionDecision, MotionDetector, BINARY_THRESHOLD};
