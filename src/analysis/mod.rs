pub mod color;
pub mod metadata;

use std::collections::HashMap;

use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AnalysisError;

pub use color::{DominantColor, Rgb};

pub const DEFAULT_DPI: f64 = 72.0;
pub const PRINT_READY_DPI: f64 = 300.0;
pub const PRINT_READY_MIN_SIDE: u32 = 1200;

const MAX_DOMINANT_COLORS: usize = 12;
const MIN_DOMINANT_FRACTION: f64 = 0.001;
const COLOR_SAMPLE_LIMIT: u64 = 1_000_000;
const TEXTURE_MAX_SIDE: u32 = 1024;
// 5 bits per channel
const BUCKET_SHIFT: u8 = 3;
const SHARPNESS_SCALE: f64 = 5.0;
const NOISE_SCALE: f64 = 5.0;

const TINY_IMAGE_PIXELS: u64 = 4096;
const HEAVY_NOISE_LEVEL: f64 = 60.0;
const FRAGMENTED_TOP_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub width: u32,
    pub height: u32,
    pub dominant_colors: Vec<DominantColor>,
    pub has_transparency: bool,
    pub sharpness: f64,
    pub noise_level: f64,
    pub dpi: f64,
    pub is_print_ready: bool,
    pub confidence: f64,
    /// SHA-256 of the analyzed bytes.
    pub digest: String,
}

impl ImageAnalysis {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn nearest_color(&self, target: Rgb) -> Option<(&DominantColor, f64)> {
        color::nearest_color(&self.dominant_colors, target)
    }
}

pub fn analyze(bytes: &[u8]) -> Result<ImageAnalysis, AnalysisError> {
    let image = decode_image(bytes)?;
    let dpi = metadata::read_dpi(bytes).unwrap_or(DEFAULT_DPI);
    Ok(analyze_decoded(&image, dpi, sha256_hex(bytes)))
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, AnalysisError> {
    let image =
        image::load_from_memory(bytes).map_err(|e| AnalysisError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(AnalysisError::Empty);
    }
    Ok(image)
}

pub fn analyze_decoded(image: &DynamicImage, dpi: f64, digest: String) -> ImageAnalysis {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let has_transparency = rgba.pixels().any(|p| p[3] < u8::MAX);
    let dominant_colors = extract_dominant_colors(&rgba);

    let luma = texture_luma(image);
    let sharpness = clamp_percent(mean_gradient_magnitude(&luma) * SHARPNESS_SCALE);
    let noise_level = clamp_percent(estimate_noise_sigma(&luma) * NOISE_SCALE);

    let is_print_ready = dpi >= PRINT_READY_DPI && width.min(height) >= PRINT_READY_MIN_SIDE;
    let pixels = u64::from(width) * u64::from(height);
    let confidence = analysis_confidence(pixels, noise_level, &dominant_colors);

    debug!(
        width,
        height,
        colors = dominant_colors.len(),
        sharpness,
        noise_level,
        confidence,
        "image analyzed"
    );

    ImageAnalysis {
        width,
        height,
        dominant_colors,
        has_transparency,
        sharpness: round_to_2(sharpness),
        noise_level: round_to_2(noise_level),
        dpi,
        is_print_ready,
        confidence,
        digest,
    }
}

#[derive(Default)]
struct Bucket {
    r: u64,
    g: u64,
    b: u64,
    count: u64,
}

fn extract_dominant_colors(rgba: &RgbaImage) -> Vec<DominantColor> {
    let total = u64::from(rgba.width()) * u64::from(rgba.height());
    let stride = sample_stride(total, COLOR_SAMPLE_LIMIT);
    let mut buckets: HashMap<u32, Bucket> = HashMap::new();
    let mut sampled = 0_u64;

    for pixel in rgba.pixels().step_by(stride as usize) {
        sampled += 1;
        let [r, g, b, a] = pixel.0;
        if a == 0 {
            continue;
        }
        let key = (u32::from(r >> BUCKET_SHIFT) << 10)
            | (u32::from(g >> BUCKET_SHIFT) << 5)
            | u32::from(b >> BUCKET_SHIFT);
        let bucket = buckets.entry(key).or_default();
        bucket.r += u64::from(r);
        bucket.g += u64::from(g);
        bucket.b += u64::from(b);
        bucket.count += 1;
    }
    if sampled == 0 {
        return Vec::new();
    }

    let mut ranked = buckets.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|(ka, a), (kb, b)| b.count.cmp(&a.count).then(ka.cmp(kb)));
    ranked
        .into_iter()
        .map(|(_, bucket)| {
            let mean = |sum: u64| ((sum as f64) / (bucket.count as f64)).round() as u8;
            let rgb = Rgb::new(mean(bucket.r), mean(bucket.g), mean(bucket.b));
            DominantColor::new(rgb, round_to_4(bucket.count as f64 / sampled as f64))
        })
        .filter(|color| color.pixel_fraction >= MIN_DOMINANT_FRACTION)
        .take(MAX_DOMINANT_COLORS)
        .collect()
}

fn texture_luma(image: &DynamicImage) -> GrayImage {
    if image.width() > TEXTURE_MAX_SIDE || image.height() > TEXTURE_MAX_SIDE {
        image.thumbnail(TEXTURE_MAX_SIDE, TEXTURE_MAX_SIDE).to_luma8()
    } else {
        image.to_luma8()
    }
}

fn mean_gradient_magnitude(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| f64::from(luma.get_pixel(x, y)[0]);
    let mut sum = 0.0_f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = at(x + 1, y) - at(x - 1, y);
            let gy = at(x, y + 1) - at(x, y - 1);
            sum += (gx * gx + gy * gy).sqrt() / 2.0;
        }
    }
    sum / (f64::from(w - 2) * f64::from(h - 2))
}

/// Immerkaer's fast noise estimate over a Laplacian-difference mask.
fn estimate_noise_sigma(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| f64::from(luma.get_pixel(x, y)[0]);
    let mut sum = 0.0_f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let v = at(x - 1, y - 1) - 2.0 * at(x, y - 1) + at(x + 1, y - 1)
                - 2.0 * at(x - 1, y)
                + 4.0 * at(x, y)
                - 2.0 * at(x + 1, y)
                + at(x - 1, y + 1)
                - 2.0 * at(x, y + 1)
                + at(x + 1, y + 1);
            sum += v.abs();
        }
    }
    (std::f64::consts::PI / 2.0).sqrt() * sum / (6.0 * f64::from(w - 2) * f64::from(h - 2))
}

fn analysis_confidence(pixels: u64, noise_level: f64, colors: &[DominantColor]) -> f64 {
    let mut confidence = 100.0_f64;
    if pixels < TINY_IMAGE_PIXELS {
        confidence -= 20.0;
    }
    if noise_level > HEAVY_NOISE_LEVEL {
        confidence -= 15.0;
    }
    let top = colors.first().map(|c| c.pixel_fraction).unwrap_or(0.0);
    if top < FRAGMENTED_TOP_FRACTION {
        confidence -= 10.0;
    }
    clamp_percent(confidence)
}

pub(crate) fn sample_stride(total: u64, limit: u64) -> u64 {
    if limit == 0 || total <= limit {
        1
    } else {
        total.div_ceil(limit)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

pub(crate) fn clamp_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

fn round_to_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_to_4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn encode_png(image: RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png should encode");
        out.into_inner()
    }

    fn split_image(width: u32, height: u32, left_cols: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            if x < left_cols {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn reports_dominant_colors_with_fractions() {
        let analysis = analyze(&encode_png(split_image(100, 100, 40))).expect("should analyze");
        assert_eq!(analysis.width, 100);
        assert_eq!(analysis.height, 100);
        assert_eq!(analysis.dominant_colors.len(), 2);
        assert_eq!(analysis.dominant_colors[0].hex, "#ffffff");
        assert_eq!(analysis.dominant_colors[0].pixel_fraction, 0.6);
        assert_eq!(analysis.dominant_colors[1].hex, "#ff0000");
        assert_eq!(analysis.dominant_colors[1].pixel_fraction, 0.4);
        assert!(!analysis.has_transparency);
        assert_eq!(analysis.dpi, DEFAULT_DPI);
        assert!(!analysis.is_print_ready);
        assert_eq!(analysis.confidence, 100.0);
    }

    #[test]
    fn is_deterministic_for_identical_bytes() {
        let bytes = encode_png(split_image(64, 64, 20));
        let first = analyze(&bytes).expect("first analysis");
        let second = analyze(&bytes).expect("second analysis");
        assert_eq!(first, second);
        assert_eq!(first.digest.len(), 64);
    }

    #[test]
    fn detects_transparency_and_excludes_clear_pixels_from_palette() {
        let image = RgbaImage::from_fn(80, 80, |x, _| {
            if x < 40 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let analysis = analyze(&encode_png(image)).expect("should analyze");
        assert!(analysis.has_transparency);
        assert_eq!(analysis.dominant_colors.len(), 1);
        assert_eq!(analysis.dominant_colors[0].hex, "#0000ff");
        assert_eq!(analysis.dominant_colors[0].pixel_fraction, 0.5);
    }

    #[test]
    fn flat_images_are_neither_sharp_nor_noisy() {
        let flat = RgbaImage::from_pixel(50, 50, Rgba([120, 120, 120, 255]));
        let analysis = analyze(&encode_png(flat)).expect("should analyze");
        assert_eq!(analysis.sharpness, 0.0);
        assert_eq!(analysis.noise_level, 0.0);
    }

    #[test]
    fn checkerboard_is_noisier_than_split_image() {
        let checker = RgbaImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let noisy = analyze(&encode_png(checker)).expect("checker analysis");
        let smooth = analyze(&encode_png(split_image(64, 64, 32))).expect("split analysis");
        assert!(noisy.noise_level > smooth.noise_level);
        assert_eq!(noisy.noise_level, 100.0);
    }

    #[test]
    fn tiny_images_lower_confidence() {
        let tiny = RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 255]));
        let analysis = analyze(&encode_png(tiny)).expect("should analyze");
        assert_eq!(analysis.confidence, 80.0);
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let err = analyze(b"definitely not an image").expect_err("should fail");
        assert!(matches!(err, AnalysisError::Decode(_)));
    }

    #[test]
    fn sample_stride_covers_limit() {
        assert_eq!(sample_stride(100, 1_000), 1);
        assert_eq!(sample_stride(2_000, 1_000), 2);
        assert_eq!(sample_stride(2_001, 1_000), 3);
    }
}
