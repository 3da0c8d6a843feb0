use super::source::{CameraDevice, CameraOpener};
use crate::error::CameraError;
use image::{DynamicImage, Luma, Rgb, RgbImage};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared between a synthetic opener and the devices it opens
#[derive(Debug, Default)]
pub struct SyntheticStats {
    pub opens: AtomicU64,
    pub reads: AtomicU64,
    pub releases: AtomicU64,
}

/// Camera replaying a fixed script of frames, cycling when exhausted.
///
/// Used for `backend = "synthetic"` and throughout the tests.
pub struct SyntheticOpener {
    script: Arc<Vec<DynamicImage>>,
    stats: Arc<SyntheticStats>,
    failing_opens: AtomicU32,
    fail_after_reads: Option<u64>,
}

impl SyntheticOpener {
    pub fn new(script: Vec<DynamicImage>) -> Self {
        Self {
            script: Arc::new(script),
            stats: Arc::new(SyntheticStats::default()),
            failing_opens: AtomicU32::new(0),
            fail_after_reads: None,
        }
    }

    /// A static mid-grey scene; never produces motion
    pub fn still(width: u32, height: u32) -> Self {
        let img = RgbImage::from_pixel(width, height, Rgb([96, 96, 96]));
        Self::new(vec![DynamicImage::ImageRgb8(img)])
    }

    /// The next `count` opens fail
    pub fn fail_next_opens(self, count: u32) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    /// Every device errors after this many reads
    pub fn fail_after_reads(mut self, reads: u64) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }
}

impl CameraOpener for SyntheticOpener {
    fn open(&self) -> Result<Box<dyn CameraDevice>, CameraError> {
        let remaining = self.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(CameraError::OpenFailed {
                device: self.describe(),
                details: "scripted open failure".to_string(),
            });
        }

        if self.script.is_empty() {
            return Err(CameraError::OpenFailed {
                device: self.describe(),
                details: "empty frame script".to_string(),
            });
        }

        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticCamera {
            script: Arc::clone(&self.script),
            stats: Arc::clone(&self.stats),
            cursor: 0,
            fail_after_reads: self.fail_after_reads,
            released: false,
        }))
    }

    fn describe(&self) -> String {
        "synthetic".to_string()
    }
}

pub struct SyntheticCamera {
    script: Arc<Vec<DynamicImage>>,
    stats: Arc<SyntheticStats>,
    cursor: usize,
    fail_after_reads: Option<u64>,
    released: bool,
}

impl CameraDevice for SyntheticCamera {
    fn read_frame(&mut self) -> Result<DynamicImage, CameraError> {
        if self.released {
            return Err(CameraError::ReadFailed {
                details: "camera released".to_string(),
            });
        }
        if let Some(limit) = self.fail_after_reads {
            if self.cursor as u64 >= limit {
                return Err(CameraError::ReadFailed {
                    details: "scripted read failure".to_string(),
                });
            }
        }

        let frame = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Horizontal gradient with an optional saturated square at `(x, y)`, for
/// motion scripts. The gradient gives histogram matching something to work on.
pub fn square_frame(width: u32, height: u32, square: Option<(u32, u32, u32)>) -> DynamicImage {
    let mut img = image::GrayImage::from_fn(width, height, |x, _| Luma([(x * 2).min(200) as u8]));
    if let Some((x, y, size)) = square {
        for py in y..(y + size).min(height) {
            for px in x..(x + size).min(width) {
                img.put_pixel(px, py, Luma([255]));
            }
        }
    }
    DynamicImage::ImageLuma8(img)
}
