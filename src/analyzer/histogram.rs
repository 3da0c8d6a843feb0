use image::GrayImage;

pub type Histogram = [u64; 256];

pub fn histogram(image: &GrayImage) -> Histogram {
    let mut hist = [0u64; 256];
    for pixel in image.pixels() {
        hist[pixel.0[0] as usize] += 1;
    }
    hist
}

fn cumulative(hist: &Histogram) -> [u64; 256] {
    let mut cum = [0u64; 256];
    let mut running = 0u64;
    for (level, count) in hist.iter().enumerate() {
        running += count;
        cum[level] = running;
    }
    cum
}

/// Lookup table mapping each source level to the smallest reference level
/// whose CDF is at least the source CDF.
///
/// CDFs are compared as exact fractions so an image matched against itself
/// maps every populated level to itself.
pub fn matching_lut(source: &Histogram, reference: &Histogram) -> [u8; 256] {
    let src_cum = cumulative(source);
    let ref_cum = cumulative(reference);
    let src_total = src_cum[255] as u128;
    let ref_total = ref_cum[255] as u128;

    let mut lut = [0u8; 256];
    if src_total == 0 || ref_total == 0 {
        for (level, entry) in lut.iter_mut().enumerate() {
            *entry = level as u8;
        }
        return lut;
    }

    let mut r = 0usize;
    for s in 0..256 {
        // src_cdf[s] is non-decreasing, so the search can resume from r
        let needed = src_cum[s] as u128 * ref_total;
        while r < 255 && (ref_cum[r] as u128) * src_total < needed {
            r += 1;
        }
        lut[s] = r as u8;
    }
    lut
}

/// Remap `source` so its luminance distribution follows `reference`
pub fn match_histogram(source: &GrayImage, reference: &GrayImage) -> GrayImage {
    let lut = matching_lut(&histogram(source), &histogram(reference));
    let mut out = source.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = lut[pixel.0[0] as usize];
    }
    out
}
