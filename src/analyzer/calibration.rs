//! Threshold calibration from a burst of quiet-scene frames.
//!
//! Magnitudes between consecutive frames of an empty scene show the noise
//! floor a site's day and night thresholds have to clear.

use super::motion::frame_magnitude;
use crate::error::AnalyzerError;
use crate::frame::Frame;

use serde::Serialize;
use std::fmt;

/// Magnitude of every consecutive pair `(i, i + 1)`
pub fn pairwise_magnitudes(frames: &[Frame]) -> Result<Vec<f64>, AnalyzerError> {
    let lumas: Vec<_> = frames.iter().map(Frame::luma).collect();
    let mut magnitudes = Vec::with_capacity(lumas.len().saturating_sub(1));

    for (i, pair) in lumas.windows(2).enumerate() {
        if pair[0].dimensions() != pair[1].dimensions() {
            return Err(AnalyzerError::DimensionMismatch {
                index: i + 1,
                expected: pair[0].dimensions(),
                actual: pair[1].dimensions(),
            });
        }
        magnitudes.push(frame_magnitude(&pair[0], &pair[1], None));
    }

    Ok(magnitudes)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MagnitudeStats {
    pub samples: usize,
    pub max: f64,
    pub mean: f64,
    pub min: f64,
    /// Sample standard deviation
    pub stdev: f64,
    pub mean_plus_1sd: f64,
    pub mean_plus_2sd: f64,
}

impl MagnitudeStats {
    /// `None` below two samples, where a sample deviation is undefined
    pub fn from_magnitudes(magnitudes: &[f64]) -> Option<Self> {
        if magnitudes.len() < 2 {
            return None;
        }

        let n = magnitudes.len() as f64;
        let mean = magnitudes.iter().sum::<f64>() / n;
        let variance = magnitudes.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let stdev = variance.sqrt();

        Some(Self {
            samples: magnitudes.len(),
            max: magnitudes.iter().copied().fold(f64::MIN, f64::max),
            mean,
            min: magnitudes.iter().copied().fold(f64::MAX, f64::min),
            stdev,
            mean_plus_1sd: mean + stdev,
            mean_plus_2sd: mean + 2.0 * stdev,
        })
    }
}

impl fmt::Display for MagnitudeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SAMPLES:   {}", self.samples)?;
        writeln!(f, "MAX:       {:.1}", self.max)?;
        writeln!(f, "MEAN:      {:.1}", self.mean)?;
        writeln!(f, "MIN:       {:.1}", self.min)?;
        writeln!(f, "STD:       {:.1}", self.stdev)?;
        writeln!(f, "MEAN+1STD: {:.1}", self.mean_plus_1sd)?;
        write!(f, "MEAN+2STD: {:.1}", self.mean_plus_2sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::square_frame;

    fn frame(square: Option<(u32, u32, u32)>) -> Frame {
        Frame::new(0, square_frame(64, 48, square))
    }

    #[test]
    fn test_one_magnitude_per_consecutive_pair() {
        let frames = vec![frame(None), frame(None), frame(Some((20, 10, 16))), frame(Some((20, 10, 16)))];
        let magnitudes = pairwise_magnitudes(&frames).unwrap();

        assert_eq!(magnitudes.len(), 3);
        assert_eq!(magnitudes[0], 0.0);
        assert!(magnitudes[1] > 200.0, "magnitude {}", magnitudes[1]);
        // Compared against its predecessor, not the first frame
        assert_eq!(magnitudes[2], 0.0);
    }

    #[test]
    fn test_mismatched_frame_is_rejected() {
        let frames = vec![frame(None), Frame::new(0, square_frame(32, 32, None))];
        assert!(matches!(
            pairwise_magnitudes(&frames),
            Err(AnalyzerError::DimensionMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_stats_use_sample_deviation() {
        let stats = MagnitudeStats::from_magnitudes(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();

        assert_eq!(stats.samples, 8);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.mean, 5.0);
        let expected = (32.0f64 / 7.0).sqrt();
        assert!((stats.stdev - expected).abs() < 1e-9);
        assert!((stats.mean_plus_1sd - (5.0 + expected)).abs() < 1e-9);
        assert!((stats.mean_plus_2sd - (5.0 + 2.0 * expected)).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_samples() {
        assert!(MagnitudeStats::from_magnitudes(&[]).is_none());
        assert!(MagnitudeStats::from_magnitudes(&[3.0]).is_none());
    }

    #[test]
    fn test_display_lists_every_statistic() {
        let rendered = MagnitudeStats::from_magnitudes(&[1.0, 3.0]).unwrap().to_string();
        for label in ["MAX:", "MEAN:", "MIN:", "STD:", "MEAN+1STD:", "MEAN+2STD:"] {
            assert!(rendered.contains(label), "missing {} in {}", label, rendered);
        }
    }
}
