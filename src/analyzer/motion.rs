use super::histogram::match_histogram;
use crate::error::AnalyzerError;
use crate::frame::Frame;

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::{
    contours::{find_contours, BorderType},
    contrast::threshold,
    distance_transform::Norm,
    morphology::{dilate, erode},
    point::Point,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Intensity above which a normalised difference pixel counts as changed
pub const BINARY_THRESHOLD: u8 = 125;

const ERODE_ITERATIONS: usize = 1;
const DILATE_ITERATIONS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum MotionDecision {
    /// `frame_index` is the position in the evaluated sequence of the first
    /// frame whose magnitude exceeded the threshold
    Motion { frame_index: usize, magnitude: f64 },
    /// One magnitude per non-reference frame, in order
    Still { magnitudes: Vec<f64> },
}

impl MotionDecision {
    pub fn is_motion(&self) -> bool {
        matches!(self, MotionDecision::Motion { .. })
    }

    /// Confirming magnitude, or the largest observed one for a negative result
    pub fn peak_magnitude(&self) -> f64 {
        match self {
            MotionDecision::Motion { magnitude, .. } => *magnitude,
            MotionDecision::Still { magnitudes } => magnitudes.iter().copied().fold(0.0, f64::max),
        }
    }
}

/// Reference-frame differencing over an ordered frame sequence
#[derive(Debug, Clone, Default)]
pub struct MotionDetector {
    roi_mask: Option<Arc<GrayImage>>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changed pixels outside the white area of `mask` are ignored
    pub fn with_roi_mask(mut self, mask: Option<Arc<GrayImage>>) -> Self {
        self.roi_mask = mask;
        self
    }

    pub fn has_roi_mask(&self) -> bool {
        self.roi_mask.is_some()
    }

    /// Compare every frame after the first against the first.
    ///
    /// Returns on the first frame whose magnitude exceeds `threshold`; later
    /// frames are never evaluated.
    pub fn detect(&self, frames: &[Frame], threshold: f64) -> Result<MotionDecision, AnalyzerError> {
        let Some(first) = frames.first() else {
            return Ok(MotionDecision::Still {
                magnitudes: Vec::new(),
            });
        };

        let reference = first.luma();
        let mask = self.mask_for(reference.dimensions());

        let decision = scan(frames.len().saturating_sub(1), threshold, |i| {
            let index = i + 1;
            let candidate = frames[index].luma();
            if candidate.dimensions() != reference.dimensions() {
                return Err(AnalyzerError::DimensionMismatch {
                    index,
                    expected: reference.dimensions(),
                    actual: candidate.dimensions(),
                });
            }
            let magnitude = frame_magnitude(&reference, &candidate, mask.as_ref());
            trace!("Frame {} magnitude {:.1}", index, magnitude);
            Ok(magnitude)
        })?;

        debug!("Motion decision: {:?}", decision);
        Ok(decision)
    }

    fn mask_for(&self, (width, height): (u32, u32)) -> Option<GrayImage> {
        let mask = self.roi_mask.as_ref()?;
        if mask.dimensions() == (width, height) {
            Some(mask.as_ref().clone())
        } else {
            Some(imageops::resize(mask.as_ref(), width, height, FilterType::Nearest))
        }
    }
}

/// Short-circuiting threshold scan over `count` candidate magnitudes.
///
/// `magnitude_of(i)` yields the magnitude of candidate `i`; the reported
/// `frame_index` is `i + 1` because candidate 0 is the frame after the
/// reference.
pub(crate) fn scan<F>(count: usize, threshold: f64, mut magnitude_of: F) -> Result<MotionDecision, AnalyzerError>
where
    F: FnMut(usize) -> Result<f64, AnalyzerError>,
{
    let mut magnitudes = Vec::with_capacity(count);
    for i in 0..count {
        let magnitude = magnitude_of(i)?;
        if magnitude > threshold {
            return Ok(MotionDecision::Motion {
                frame_index: i + 1,
                magnitude,
            });
        }
        magnitudes.push(magnitude);
    }
    Ok(MotionDecision::Still { magnitudes })
}

/// Largest external contour area of the cleaned difference between two frames
pub fn frame_magnitude(reference: &GrayImage, candidate: &GrayImage, mask: Option<&GrayImage>) -> f64 {
    let matched = match_histogram(candidate, reference);
    let diff = normalize_min_max(&abs_diff(reference, &matched));
    let mut binary = threshold(&diff, BINARY_THRESHOLD);

    if let Some(mask) = mask {
        for (pixel, m) in binary.pixels_mut().zip(mask.pixels()) {
            pixel.0[0] &= m.0[0];
        }
    }

    let mut cleaned = binary;
    for _ in 0..ERODE_ITERATIONS {
        cleaned = erode(&cleaned, Norm::LInf, 1);
    }
    for _ in 0..DILATE_ITERATIONS {
        cleaned = dilate(&cleaned, Norm::LInf, 1);
    }

    max_external_contour_area(&cleaned)
}

fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(a.width(), a.height());
    for ((o, pa), pb) in out.pixels_mut().zip(a.pixels()).zip(b.pixels()) {
        o.0[0] = pa.0[0].abs_diff(pb.0[0]);
    }
    out
}

/// Stretch to 0..=255; a flat image becomes all zero
fn normalize_min_max(image: &GrayImage) -> GrayImage {
    let (min, max) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));

    let mut out = GrayImage::new(image.width(), image.height());
    if max <= min {
        return out;
    }

    let scale = 255.0 / f32::from(max - min);
    for (o, p) in out.pixels_mut().zip(image.pixels()) {
        o.0[0] = (f32::from(p.0[0] - min) * scale).round() as u8;
    }
    out
}

fn max_external_contour_area(binary: &GrayImage) -> f64 {
    find_contours::<i32>(binary)
        .iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
        .map(|c| polygon_area(&c.points))
        .fold(0.0, f64::max)
}

/// Shoelace formula over the closed polygon
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice.abs() as f64 / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::square_frame;
    use image::Luma;

    fn frame(square: Option<(u32, u32, u32)>) -> Frame {
        Frame::new(0, square_frame(64, 48, square))
    }

    #[test]
    fn test_fewer_than_two_frames_is_still() {
        let detector = MotionDetector::new();
        assert_eq!(
            detector.detect(&[], 10.0).unwrap(),
            MotionDecision::Still { magnitudes: vec![] }
        );
        assert_eq!(
            detector.detect(&[frame(None)], 10.0).unwrap(),
            MotionDecision::Still { magnitudes: vec![] }
        );
    }

    #[test]
    fn test_identical_frames_have_zero_magnitude() {
        let frames = vec![frame(None), frame(None), frame(None)];
        let decision = MotionDetector::new().detect(&frames, 0.0).unwrap();
        assert_eq!(
            decision,
            MotionDecision::Still {
                magnitudes: vec![0.0, 0.0]
            }
        );
    }

    #[test]
    fn test_negative_result_has_one_magnitude_per_candidate() {
        let frames: Vec<Frame> = (0..6).map(|_| frame(None)).collect();
        match MotionDetector::new().detect(&frames, 1.0e9).unwrap() {
            MotionDecision::Still { magnitudes } => assert_eq!(magnitudes.len(), frames.len() - 1),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_moving_square_is_detected() {
        let frames = vec![frame(None), frame(None), frame(Some((20, 10, 16)))];
        let decision = MotionDetector::new().detect(&frames, 50.0).unwrap();
        match decision {
            MotionDecision::Motion {
                frame_index,
                magnitude,
            } => {
                assert_eq!(frame_index, 2);
                // 16px square, eroded once and dilated three times
                assert!(magnitude > 200.0, "magnitude {}", magnitude);
            }
            other => panic!("expected motion, got {:?}", other),
        }
    }

    #[test]
    fn test_single_pixel_noise_is_eroded() {
        let reference = GrayImage::from_fn(32, 32, |x, _| Luma([(x * 3) as u8]));
        let mut noisy = reference.clone();
        noisy.put_pixel(10, 10, Luma([250]));
        assert_eq!(frame_magnitude(&reference, &noisy, None), 0.0);
    }

    #[test]
    fn test_roi_mask_suppresses_masked_region() {
        let frames = vec![frame(None), frame(Some((20, 10, 16)))];

        // Mask at half resolution, black everywhere: resized with nearest
        let blind = Arc::new(GrayImage::from_pixel(32, 24, Luma([0])));
        let detector = MotionDetector::new().with_roi_mask(Some(blind));
        assert!(detector.has_roi_mask());
        assert_eq!(
            detector.detect(&frames, 0.0).unwrap(),
            MotionDecision::Still {
                magnitudes: vec![0.0]
            }
        );

        let open = Arc::new(GrayImage::from_pixel(32, 24, Luma([255])));
        let detector = MotionDetector::new().with_roi_mask(Some(open));
        assert!(detector.detect(&frames, 0.0).unwrap().is_motion());
    }

    #[test]
    fn test_dimension_mismatch_is_reported() {
        let frames = vec![
            frame(None),
            Frame::new(1, square_frame(32, 32, None)),
        ];
        assert!(matches!(
            MotionDetector::new().detect(&frames, 0.0),
            Err(AnalyzerError::DimensionMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_scan_short_circuits_on_first_crossing() {
        let magnitudes = [0.0, 0.0, 0.0, 1200.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut evaluated = Vec::new();

        let decision = scan(magnitudes.len(), 1000.0, |i| {
            evaluated.push(i);
            Ok(magnitudes[i])
        })
        .unwrap();

        assert_eq!(
            decision,
            MotionDecision::Motion {
                frame_index: 4,
                magnitude: 1200.0
            }
        );
        assert_eq!(evaluated, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_scan_first_crossing_wins() {
        let magnitudes = [10.0, 5000.0, 9000.0];
        let decision = scan(magnitudes.len(), 1000.0, |i| Ok(magnitudes[i])).unwrap();
        assert_eq!(decision.peak_magnitude(), 5000.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let decision = scan(1, 1000.0, |_| Ok(1000.0)).unwrap();
        assert!(!decision.is_motion());
    }

    #[test]
    fn test_polygon_area() {
        let square = [
            Point::new(0, 0),
            Point::new(4, 0),
            Point::new(4, 4),
            Point::new(0, 4),
        ];
        assert_eq!(polygon_area(&square), 16.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn test_flat_difference_normalizes_to_zero() {
        let flat = GrayImage::from_pixel(4, 4, Luma([7]));
        assert!(normalize_min_max(&flat).pixels().all(|p| p.0[0] == 0));
    }
}
