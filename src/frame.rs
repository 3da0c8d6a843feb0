use chrono::{DateTime, TimeZone, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageError};

/// File extension used for every frame written to disk
pub const FRAME_EXTENSION: &str = "jpg";

/// A captured raster frame keyed by its capture time in milliseconds
#[derive(Debug, Clone)]
pub struct Frame {
    /// Milliseconds since the Unix epoch; also the on-disk file stem
    pub timestamp_ms: i64,
    /// Decoded image
    pub image: DynamicImage,
}

impl Frame {
    pub fn new(timestamp_ms: i64, image: DynamicImage) -> Self {
        Self {
            timestamp_ms,
            image,
        }
    }

    /// Night frames carry no useful colour; keep luminance only
    pub fn into_grayscale(self) -> Self {
        Self {
            timestamp_ms: self.timestamp_ms,
            image: DynamicImage::ImageLuma8(self.image.to_luma8()),
        }
    }

    pub fn luma(&self) -> GrayImage {
        self.image.to_luma8()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// `<timestamp_ms>.jpg`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.timestamp_ms, FRAME_EXTENSION)
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, ImageError> {
        encode_jpeg(&self.image, quality)
    }
}

/// Parse the millisecond timestamp back out of a frame file name
pub fn timestamp_from_file_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(FRAME_EXTENSION)?.strip_suffix('.')?;
    stem.parse().ok()
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(image)?;
    Ok(buf)
}

/// Decode a stored frame, scale it to the upload resolution and re-encode
pub fn prepare_for_upload(
    jpeg: &[u8],
    (width, height): (u32, u32),
    quality: u8,
) -> Result<Vec<u8>, ImageError> {
    let img = image::load_from_memory(jpeg)?;
    let scaled = if img.width() == width && img.height() == height {
        img
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    };
    encode_jpeg(&scaled, quality)
}
