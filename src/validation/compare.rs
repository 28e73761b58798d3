use image::RgbaImage;
use serde::Serialize;

use crate::analysis::{clamp_percent, sample_stride};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PixelComparison {
    /// Pixels in the overlapping region, sampled or not.
    pub compared_pixels: u64,
    pub sampled_pixels: u64,
    pub pixels_changed: u64,
    pub percentage_changed: f64,
    pub max_delta: f64,
    pub avg_delta: f64,
    /// Magnitude of the mean signed RGB difference.
    pub color_shift_amount: f64,
}

/// Compares the overlapping region pixel by pixel using RGBA Euclidean distance.
///
/// A pixel counts as changed only when its delta exceeds `threshold`. Above
/// `sample_limit` overlapping pixels a staggered grid is compared and the
/// changed count is scaled back to the full overlap.
pub fn compare_pixels(
    before: &RgbaImage,
    after: &RgbaImage,
    threshold: f64,
    sample_limit: u64,
) -> PixelComparison {
    let width = before.width().min(after.width());
    let height = before.height().min(after.height());
    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return PixelComparison::default();
    }
    // Sample on a square grid, staggering each sampled row by one column so
    // a step that divides the width cannot skip the same columns every row.
    let step = (sample_stride(total, sample_limit) as f64).sqrt().ceil().max(1.0) as u32;

    let mut sampled = 0_u64;
    let mut changed = 0_u64;
    let mut max_delta = 0.0_f64;
    let mut delta_sum = 0.0_f64;
    let mut shift = [0.0_f64; 3];

    for y in (0..height).step_by(step as usize) {
        let offset = (y / step) % step;
        for x in (offset..width).step_by(step as usize) {
            let a = before.get_pixel(x, y).0;
            let b = after.get_pixel(x, y).0;
            let mut squared = 0.0_f64;
            for channel in 0..4 {
                let d = f64::from(b[channel]) - f64::from(a[channel]);
                squared += d * d;
                if channel < 3 {
                    shift[channel] += d;
                }
            }
            let delta = squared.sqrt();
            max_delta = max_delta.max(delta);
            delta_sum += delta;
            if delta > threshold {
                changed += 1;
            }
            sampled += 1;
        }
    }

    let samples = sampled as f64;
    let color_shift_amount = shift
        .iter()
        .map(|sum| (sum / samples).powi(2))
        .sum::<f64>()
        .sqrt();
    let pixels_changed = if step == 1 {
        changed
    } else {
        ((changed as f64 / samples) * total as f64).round() as u64
    };

    PixelComparison {
        compared_pixels: total,
        sampled_pixels: sampled,
        pixels_changed,
        percentage_changed: clamp_percent(changed as f64 / samples * 100.0),
        max_delta,
        avg_delta: delta_sum / samples,
        color_shift_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn split_image(width: u32, height: u32, changed_cols: u32, left: Rgba<u8>, right: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| if x < changed_cols { left } else { right })
    }

    #[test]
    fn identical_images_have_no_change() {
        let img = RgbaImage::from_pixel(20, 20, Rgba([10, 20, 30, 255]));
        let cmp = compare_pixels(&img, &img, 10.0, 4_000_000);
        assert_eq!(cmp.pixels_changed, 0);
        assert_eq!(cmp.percentage_changed, 0.0);
        assert_eq!(cmp.max_delta, 0.0);
        assert_eq!(cmp.compared_pixels, 400);
    }

    #[test]
    fn counts_only_deltas_above_threshold() {
        let before = RgbaImage::from_pixel(10, 10, Rgba([100, 100, 100, 255]));
        // 4 columns shift by a visible amount, the rest by compression-sized noise.
        let after = split_image(10, 10, 4, Rgba([100, 100, 100, 0]), Rgba([103, 100, 100, 255]));
        let cmp = compare_pixels(&before, &after, 10.0, 4_000_000);
        assert_eq!(cmp.pixels_changed, 40);
        assert_eq!(cmp.percentage_changed, 40.0);
        assert_eq!(cmp.max_delta, 255.0);
    }

    #[test]
    fn sampling_keeps_the_changed_fraction() {
        let before = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let after = split_image(100, 100, 50, Rgba([255, 255, 255, 255]), Rgba([0, 0, 0, 255]));
        let cmp = compare_pixels(&before, &after, 10.0, 1_000);
        assert!(cmp.sampled_pixels <= 1_000);
        assert!((cmp.percentage_changed - 50.0).abs() < 2.0);
        assert!((cmp.pixels_changed as f64 - 5_000.0).abs() < 200.0);
    }

    #[test]
    fn sampling_sees_changes_confined_to_alternate_columns() {
        let before = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let after = RgbaImage::from_fn(100, 100, |x, _| {
            if x % 2 == 1 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        });
        let cmp = compare_pixels(&before, &after, 10.0, 5_000);
        assert!(cmp.sampled_pixels < 10_000);
        assert_eq!(cmp.percentage_changed, 50.0);
        assert_eq!(cmp.pixels_changed, 5_000);
    }

    #[test]
    fn compares_only_the_overlap() {
        let before = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let after = RgbaImage::from_pixel(20, 5, Rgba([0, 0, 0, 255]));
        let cmp = compare_pixels(&before, &after, 10.0, 4_000_000);
        assert_eq!(cmp.compared_pixels, 50);
    }
}
