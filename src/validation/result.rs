use image::DynamicImage;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::compare::{compare_pixels, PixelComparison};
use crate::analysis::{
    analyze_decoded, clamp_percent, decode_image, metadata, sha256_hex, ImageAnalysis,
    DEFAULT_DPI, PRINT_READY_DPI, PRINT_READY_MIN_SIDE,
};
use crate::error::ResultMismatchError;
use crate::history::ResultMetrics;
use crate::settings::GuardSettings;
use crate::tools::{DimensionExpectation, ExpectedOperationProfile, ToolSpec};

pub const SIGNIFICANT_CHANGE_PERCENT: f64 = 0.1;

const SHARPNESS_DROP_LIMIT: f64 = 10.0;
const NOISE_RISE_LIMIT: f64 = 10.0;
const DEGRADATION_PENALTY: f64 = 10.0;
const NO_CHANGE_PENALTY: f64 = 40.0;
const PURPOSE_BONUS: f64 = 10.0;
const BORDERLINE_PENALTY: f64 = 5.0;

/// What a finished tool run must look like: the tool's static profile plus
/// the dimensions its parameters imply for this call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultExpectation {
    pub profile: ExpectedOperationProfile,
    pub target_dimensions: Option<(u32, u32)>,
}

impl ResultExpectation {
    pub fn for_tool(spec: &ToolSpec, params: &Map<String, Value>, before: (u32, u32)) -> Self {
        Self {
            profile: spec.profile,
            target_dimensions: spec.expected_dimensions(params, before),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VisualDifference {
    pub max_delta: f64,
    pub avg_delta: f64,
    pub color_shift_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultValidation {
    pub success: bool,
    pub pixels_changed: u64,
    pub percentage_changed: f64,
    pub significant_change: bool,
    pub quality_score: f64,
    pub visual_difference: VisualDifference,
    pub warnings: Vec<String>,
    pub failures: Vec<ResultMismatchError>,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_analysis: Option<ImageAnalysis>,
}

impl ResultValidation {
    fn failed_early(failure: ResultMismatchError) -> Self {
        Self {
            success: false,
            pixels_changed: 0,
            percentage_changed: 0.0,
            significant_change: false,
            quality_score: 0.0,
            visual_difference: VisualDifference::default(),
            warnings: Vec::new(),
            reasoning: failure.to_string(),
            failures: vec![failure],
            after_analysis: None,
        }
    }

    pub fn has_failure(&self, predicate: impl Fn(&ResultMismatchError) -> bool) -> bool {
        self.failures.iter().any(predicate)
    }

    pub fn metrics(&self, execution_time_ms: u64) -> ResultMetrics {
        ResultMetrics {
            pixels_changed: self.pixels_changed,
            percentage_changed: self.percentage_changed,
            quality_score: self.quality_score,
            execution_time_ms,
        }
    }
}

/// Post-execution gate. Never fails outward: decode problems and mismatches
/// come back as `success = false` with reasoning.
#[derive(Debug, Clone, Default)]
pub struct ResultValidator {
    settings: GuardSettings,
}

impl ResultValidator {
    pub fn new(settings: GuardSettings) -> Self {
        Self { settings }
    }

    pub fn validate(
        &self,
        tool_name: &str,
        before: &[u8],
        after: &[u8],
        expectation: &ResultExpectation,
    ) -> ResultValidation {
        let before_image = match decode_image(before) {
            Ok(image) => image,
            Err(err) => {
                return ResultValidation::failed_early(ResultMismatchError::Undecodable {
                    which: String::from("before"),
                    message: err.to_string(),
                })
            }
        };
        let after_image = match decode_image(after) {
            Ok(image) => image,
            Err(err) => {
                return ResultValidation::failed_early(ResultMismatchError::Undecodable {
                    which: String::from("after"),
                    message: err.to_string(),
                })
            }
        };
        let before_analysis = analyze_bytes(&before_image, before);
        let after_analysis = analyze_bytes(&after_image, after);
        let mut verdict = Verdict::default();

        let profile = &expectation.profile;
        let before_dims = before_analysis.dimensions();
        let after_dims = after_analysis.dimensions();

        if profile.info_only {
            let cmp = self.compare(&before_image, &after_image);
            let quality = after_analysis.confidence;
            return verdict.finish(
                tool_name,
                cmp,
                quality,
                after_analysis,
                Some("information-only tool; no pixel change required"),
            );
        }

        let structural = match profile.dimensions {
            DimensionExpectation::Any => {
                if before_dims != after_dims {
                    verdict.warnings.push(format!(
                        "dimensions changed from {}x{} to {}x{}; compared the overlapping region",
                        before_dims.0, before_dims.1, after_dims.0, after_dims.1
                    ));
                }
                false
            }
            DimensionExpectation::Same => {
                if before_dims != after_dims {
                    verdict.failures.push(ResultMismatchError::DimensionsChanged {
                        before_width: before_dims.0,
                        before_height: before_dims.1,
                        after_width: after_dims.0,
                        after_height: after_dims.1,
                    });
                }
                false
            }
            DimensionExpectation::Larger => {
                let grew = after_dims.0 >= before_dims.0
                    && after_dims.1 >= before_dims.1
                    && (after_dims.0 > before_dims.0 || after_dims.1 > before_dims.1);
                if !grew {
                    verdict
                        .failures
                        .push(ResultMismatchError::DimensionsNotIncreased {
                            before_width: before_dims.0,
                            before_height: before_dims.1,
                            after_width: after_dims.0,
                            after_height: after_dims.1,
                        });
                } else if let Some(target) = expectation.target_dimensions {
                    if target.0.abs_diff(after_dims.0) > 1 || target.1.abs_diff(after_dims.1) > 1 {
                        verdict.borderline(format!(
                            "output is {}x{}, expected about {}x{}",
                            after_dims.0, after_dims.1, target.0, target.1
                        ));
                    }
                }
                true
            }
            DimensionExpectation::Declared => {
                match expectation.target_dimensions {
                    Some(target) if target != after_dims => {
                        verdict.failures.push(ResultMismatchError::DimensionMismatch {
                            expected_width: target.0,
                            expected_height: target.1,
                            actual_width: after_dims.0,
                            actual_height: after_dims.1,
                        });
                    }
                    Some(_) => {}
                    None => verdict.warnings.push(String::from(
                        "no target dimensions could be derived; dimension check skipped",
                    )),
                }
                true
            }
        };

        let cmp = if structural && before_dims != after_dims {
            // Resampled output has no pixel-to-pixel correspondence with the input.
            let after_pixels = after_analysis.pixel_count();
            let overlap = self.compare(&before_image, &after_image);
            PixelComparison {
                compared_pixels: after_pixels,
                sampled_pixels: overlap.sampled_pixels,
                pixels_changed: after_pixels,
                percentage_changed: 100.0,
                ..overlap
            }
        } else {
            self.compare(&before_image, &after_image)
        };

        if profile.requires_transparency && !after_analysis.has_transparency {
            verdict.failures.push(ResultMismatchError::NoTransparency);
        }
        if let Some(band) = profile.change_band {
            let pct = cmp.percentage_changed;
            if pct < band.min {
                if pct >= band.min - band.margin && cmp.pixels_changed > 0 {
                    verdict.borderline(format!(
                        "{pct:.2}% of pixels changed, just below the expected minimum of {}%",
                        band.min
                    ));
                } else {
                    verdict.failures.push(ResultMismatchError::NoMeaningfulChange {
                        percentage: pct,
                        min: band.min,
                    });
                }
            } else if pct > band.max {
                if pct <= band.max + band.margin {
                    verdict.borderline(format!(
                        "{pct:.2}% of pixels changed, just above the expected maximum of {}%",
                        band.max
                    ));
                } else {
                    verdict.failures.push(ResultMismatchError::OverDestructive {
                        percentage: pct,
                        max: band.max,
                    });
                }
            }
        }
        if cmp.pixels_changed == 0 {
            verdict.failures.push(ResultMismatchError::NoPixelsChanged);
        }

        let significant =
            cmp.pixels_changed > 0 && cmp.percentage_changed >= SIGNIFICANT_CHANGE_PERCENT;
        let mut quality = after_analysis.confidence;

        let effective_sharpness = if structural && before_dims.0 > 0 {
            clamp_percent(
                after_analysis.sharpness * f64::from(after_dims.0) / f64::from(before_dims.0),
            )
        } else {
            after_analysis.sharpness
        };
        if before_analysis.sharpness - effective_sharpness > SHARPNESS_DROP_LIMIT {
            quality -= DEGRADATION_PENALTY;
            verdict.warnings.push(format!(
                "sharpness dropped from {:.1} to {effective_sharpness:.1}",
                before_analysis.sharpness
            ));
        }
        if after_analysis.noise_level - before_analysis.noise_level > NOISE_RISE_LIMIT {
            quality -= DEGRADATION_PENALTY;
            verdict.warnings.push(format!(
                "noise rose from {:.1} to {:.1}",
                before_analysis.noise_level, after_analysis.noise_level
            ));
        }
        if !significant {
            quality -= NO_CHANGE_PENALTY;
        }
        if profile.rewards_print_readiness
            && print_readiness_achieved(&before_analysis, &after_analysis)
        {
            quality += PURPOSE_BONUS;
        }
        quality -= BORDERLINE_PENALTY * verdict.borderline as f64;

        verdict.finish(tool_name, cmp, quality, after_analysis, None)
    }

    fn compare(&self, before: &DynamicImage, after: &DynamicImage) -> PixelComparison {
        compare_pixels(
            &before.to_rgba8(),
            &after.to_rgba8(),
            self.settings.pixel_change_threshold,
            self.settings.comparison_sample_limit,
        )
    }
}

#[derive(Default)]
struct Verdict {
    warnings: Vec<String>,
    failures: Vec<ResultMismatchError>,
    borderline: u32,
}

impl Verdict {
    fn borderline(&mut self, message: String) {
        self.warnings.push(message);
        self.borderline += 1;
    }

    fn finish(
        self,
        tool_name: &str,
        cmp: PixelComparison,
        quality: f64,
        after_analysis: ImageAnalysis,
        note: Option<&str>,
    ) -> ResultValidation {
        let success = self.failures.is_empty();
        let reasoning = if success {
            let mut text = format!(
                "{tool_name}: {:.2}% of pixels changed; result matches the expected effect",
                cmp.percentage_changed
            );
            if let Some(note) = note {
                text = format!("{text} ({note})");
            }
            text
        } else {
            let reasons = self
                .failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            format!("{tool_name}: {reasons}")
        };
        debug!(
            tool = tool_name,
            success,
            pixels_changed = cmp.pixels_changed,
            percentage = cmp.percentage_changed,
            quality,
            "result validated"
        );
        ResultValidation {
            success,
            pixels_changed: cmp.pixels_changed,
            percentage_changed: clamp_percent(cmp.percentage_changed),
            significant_change: cmp.pixels_changed > 0
                && cmp.percentage_changed >= SIGNIFICANT_CHANGE_PERCENT,
            quality_score: clamp_percent(quality),
            visual_difference: VisualDifference {
                max_delta: cmp.max_delta,
                avg_delta: cmp.avg_delta,
                color_shift_amount: cmp.color_shift_amount,
            },
            warnings: self.warnings,
            failures: self.failures,
            reasoning,
            after_analysis: Some(after_analysis),
        }
    }
}

fn analyze_bytes(image: &DynamicImage, bytes: &[u8]) -> ImageAnalysis {
    let dpi = metadata::read_dpi(bytes).unwrap_or(DEFAULT_DPI);
    analyze_decoded(image, dpi, sha256_hex(bytes))
}

/// Print-ready at the same physical size: density grows with the scale factor.
fn print_readiness_achieved(before: &ImageAnalysis, after: &ImageAnalysis) -> bool {
    if before.is_print_ready || before.width == 0 {
        return false;
    }
    let effective_dpi = before.dpi * f64::from(after.width) / f64::from(before.width);
    after.is_print_ready
        || (effective_dpi >= PRINT_READY_DPI && after.width.min(after.height) >= PRINT_READY_MIN_SIDE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry;
    use image::{ImageFormat, Rgba, RgbaImage};
    use serde_json::json;
    use std::io::Cursor;

    fn encode_png(image: RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("png encode should succeed");
        out.into_inner()
    }

    fn red_and_white() -> RgbaImage {
        RgbaImage::from_fn(100, 100, |x, _| {
            if x < 40 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    fn expectation(tool: &str, params: Value, before: (u32, u32)) -> ResultExpectation {
        let spec = registry().get(tool).expect("tool is registered");
        ResultExpectation::for_tool(spec, params.as_object().expect("object"), before)
    }

    fn validator() -> ResultValidator {
        ResultValidator::new(GuardSettings::default())
    }

    #[test]
    fn color_removal_with_transparency_succeeds() {
        let before = red_and_white();
        let after = RgbaImage::from_fn(100, 100, |x, y| {
            if x < 40 {
                Rgba([255, 0, 0, 0])
            } else {
                *before.get_pixel(x, y)
            }
        });
        let result = validator().validate(
            "remove_color",
            &encode_png(before),
            &encode_png(after),
            &expectation("remove_color", json!({"colors": ["#ff0000"]}), (100, 100)),
        );
        assert!(result.success, "{}", result.reasoning);
        assert_eq!(result.pixels_changed, 4_000);
        assert_eq!(result.percentage_changed, 40.0);
        assert!(result.significant_change);
        assert!(result.after_analysis.expect("after analysis").has_transparency);
    }

    #[test]
    fn unchanged_output_is_never_a_success() {
        let bytes = encode_png(red_and_white());
        let result = validator().validate(
            "remove_color",
            &bytes,
            &bytes,
            &expectation("remove_color", json!({"colors": ["#ff0000"]}), (100, 100)),
        );
        assert!(!result.success);
        assert_eq!(result.pixels_changed, 0);
        assert!(result.has_failure(|f| matches!(f, ResultMismatchError::NoPixelsChanged)));
        assert!(result.has_failure(|f| matches!(f, ResultMismatchError::NoTransparency)));
        assert!(result.quality_score <= 60.0);
    }

    #[test]
    fn removing_nearly_everything_is_over_destructive() {
        let before = encode_png(red_and_white());
        let after = encode_png(RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 0])));
        let result = validator().validate(
            "remove_color",
            &before,
            &after,
            &expectation("remove_color", json!({"colors": ["#ffffff"]}), (100, 100)),
        );
        assert!(!result.success);
        assert!(result.has_failure(|f| matches!(f, ResultMismatchError::OverDestructive { .. })));
    }

    #[test]
    fn recolor_must_keep_dimensions() {
        let before = encode_png(red_and_white());
        let after = encode_png(RgbaImage::from_pixel(50, 100, Rgba([0, 0, 255, 255])));
        let result = validator().validate(
            "recolor",
            &before,
            &after,
            &expectation(
                "recolor",
                json!({"from_color": "#ff0000", "to_color": "#0000ff"}),
                (100, 100),
            ),
        );
        assert!(!result.success);
        assert!(result.has_failure(|f| matches!(f, ResultMismatchError::DimensionsChanged { .. })));
    }

    #[test]
    fn upscale_requires_larger_output() {
        let before_image = red_and_white();
        let bigger = image::imageops::resize(
            &before_image,
            200,
            200,
            image::imageops::FilterType::Nearest,
        );
        let before = encode_png(before_image);
        let expect = expectation("upscale", json!({"scale_factor": 2}), (100, 100));

        let ok = validator().validate("upscale", &before, &encode_png(bigger), &expect);
        assert!(ok.success, "{}", ok.reasoning);
        assert_eq!(ok.percentage_changed, 100.0);
        assert_eq!(ok.pixels_changed, 40_000);

        let same = validator().validate("upscale", &before, &before, &expect);
        assert!(!same.success);
        assert!(same.has_failure(|f| matches!(f, ResultMismatchError::DimensionsNotIncreased { .. })));
    }

    #[test]
    fn crop_is_checked_against_declared_dimensions() {
        let before = encode_png(red_and_white());
        let after = encode_png(RgbaImage::from_pixel(30, 20, Rgba([255, 0, 0, 255])));
        let matching = validator().validate(
            "crop",
            &before,
            &after,
            &expectation("crop", json!({"x": 0, "y": 0, "width": 30, "height": 20}), (100, 100)),
        );
        assert!(matching.success, "{}", matching.reasoning);

        let mismatched = validator().validate(
            "crop",
            &before,
            &after,
            &expectation("crop", json!({"x": 0, "y": 0, "width": 40, "height": 20}), (100, 100)),
        );
        assert!(!mismatched.success);
    }

    #[test]
    fn same_size_structural_output_is_compared_pixel_by_pixel() {
        let before_image = red_and_white();
        let before = encode_png(before_image.clone());
        let expect = expectation("rotate", json!({"degrees": "90"}), (100, 100));

        let unchanged = validator().validate("rotate", &before, &before, &expect);
        assert!(!unchanged.success);
        assert_eq!(unchanged.pixels_changed, 0);
        assert_eq!(unchanged.percentage_changed, 0.0);
        assert!(unchanged.has_failure(|f| matches!(f, ResultMismatchError::NoPixelsChanged)));

        let rotated = encode_png(image::imageops::rotate90(&before_image));
        let turned = validator().validate("rotate", &before, &rotated, &expect);
        assert!(turned.success, "{}", turned.reasoning);
        assert!(turned.percentage_changed > 0.0 && turned.percentage_changed < 100.0);
    }

    #[test]
    fn info_only_tools_succeed_without_change() {
        let bytes = encode_png(red_and_white());
        let result = validator().validate(
            "extract_palette",
            &bytes,
            &bytes,
            &expectation("extract_palette", json!({}), (100, 100)),
        );
        assert!(result.success);
        assert_eq!(result.pixels_changed, 0);
    }

    #[test]
    fn undecodable_result_fails_with_zeroed_metrics() {
        let before = encode_png(red_and_white());
        let result = validator().validate(
            "remove_color",
            &before,
            b"not an image",
            &expectation("remove_color", json!({"colors": ["#ff0000"]}), (100, 100)),
        );
        assert!(!result.success);
        assert_eq!(result.quality_score, 0.0);
        assert_eq!(result.percentage_changed, 0.0);
        assert!(result.reasoning.contains("after image could not be decoded"));
    }
}
