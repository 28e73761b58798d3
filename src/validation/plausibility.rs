use serde_json::{Map, Value};
use tracing::debug;

use crate::analysis::color::tolerance_radius;
use crate::analysis::{ImageAnalysis, Rgb};
use crate::error::GroundTruthError;
use crate::settings::GuardSettings;
use crate::tools::registry::upscaled_dimensions;
use crate::tools::schema::{color_list_param, color_param, json_number, number_param};
use crate::tools::ToolSchema;

/// Recommended tolerance per point of measured noise.
pub const TOLERANCE_PER_NOISE: f64 = 0.3;
pub const MIN_USEFUL_SCALE: f64 = 1.5;

const NEAR_MATCH_PENALTY: f64 = 15.0;
const TIGHT_TOLERANCE_PENALTY: f64 = 10.0;
const NO_OP_PENALTY: f64 = 20.0;
const MINOR_PENALTY: f64 = 5.0;

pub struct PlausibilityContext<'a> {
    pub params: &'a Map<String, Value>,
    pub analysis: &'a ImageAnalysis,
    pub settings: &'a GuardSettings,
    pub schema: &'a ToolSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlausibilityReport {
    pub errors: Vec<GroundTruthError>,
    pub warnings: Vec<String>,
    pub confidence: f64,
    pub adjustments: Map<String, Value>,
}

impl Default for PlausibilityReport {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            confidence: 100.0,
            adjustments: Map::new(),
        }
    }
}

impl PlausibilityReport {
    fn warn(&mut self, message: String, penalty: f64) {
        self.warnings.push(message);
        self.confidence = (self.confidence - penalty).max(0.0);
    }

    fn fail(&mut self, error: GroundTruthError) {
        self.errors.push(error);
        self.confidence = 0.0;
    }
}

pub fn check_nothing(_ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    PlausibilityReport::default()
}

pub fn check_remove_color(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let colors = color_list_param(ctx.params, "colors");
    let mut snapped = Vec::with_capacity(colors.len());
    let mut any_snapped = false;
    for (idx, color) in colors.iter().enumerate() {
        let label = format!("colors[{idx}]");
        match check_color_presence(ctx, &mut report, label.as_str(), *color) {
            Some(nearest) => {
                snapped.push(Value::from(nearest.to_hex()));
                any_snapped = true;
            }
            None => snapped.push(Value::from(color.to_hex())),
        }
    }
    if any_snapped {
        report
            .adjustments
            .insert(String::from("colors"), Value::Array(snapped));
    }
    check_tolerance_against_noise(ctx, &mut report);
    check_coverage(ctx, &mut report, &colors);
    report
}

pub fn check_cut_texture(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    if let Some(color) = color_param(ctx.params, "texture_color") {
        if let Some(nearest) = check_color_presence(ctx, &mut report, "texture_color", color) {
            report
                .adjustments
                .insert(String::from("texture_color"), Value::from(nearest.to_hex()));
        }
        check_tolerance_against_noise(ctx, &mut report);
        check_coverage(ctx, &mut report, &[color]);
    }
    report
}

pub fn check_remove_background(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    if ctx.analysis.has_transparency {
        report.warn(
            String::from("image already has transparency; the background may already be removed"),
            TIGHT_TOLERANCE_PENALTY,
        );
    }
    if ctx
        .analysis
        .dominant_colors
        .first()
        .is_some_and(|c| c.pixel_fraction * 100.0 > ctx.settings.max_coverage_percent)
    {
        report.warn(
            String::from("image is nearly uniform; there may be no distinct subject to keep"),
            NO_OP_PENALTY,
        );
    }
    if ctx.params.contains_key("tolerance") {
        check_tolerance_against_noise(ctx, &mut report);
    }
    report
}

pub fn check_recolor(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let from = color_param(ctx.params, "from_color");
    let to = color_param(ctx.params, "to_color");
    if let Some(from) = from {
        if let Some(nearest) = check_color_presence(ctx, &mut report, "from_color", from) {
            report
                .adjustments
                .insert(String::from("from_color"), Value::from(nearest.to_hex()));
        }
    }
    if let (Some(from), Some(to)) = (from, to) {
        let distance = from.distance(to);
        if distance <= ctx.settings.match_distance {
            report.warn(
                format!(
                    "to_color {} is within {distance:.1} of from_color {}; recolor would barely change the image",
                    to.to_hex(),
                    from.to_hex()
                ),
                NO_OP_PENALTY,
            );
        }
    }
    check_tolerance_against_noise(ctx, &mut report);
    report
}

pub fn check_upscale(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let Some(factor) = number_param(ctx.params, "scale_factor") else {
        return report;
    };
    if let Some((width, height)) = upscaled_dimensions(ctx.params, ctx.analysis.dimensions()) {
        check_output_size(ctx, &mut report, u64::from(width), u64::from(height));
    }
    if factor < MIN_USEFUL_SCALE {
        report.warn(
            format!("scale_factor {factor} barely enlarges the image"),
            TIGHT_TOLERANCE_PENALTY,
        );
    }
    report
}

pub fn check_resize(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let (Some(width), Some(height)) = (
        number_param(ctx.params, "width"),
        number_param(ctx.params, "height"),
    ) else {
        return report;
    };
    let (width, height) = (width as u64, height as u64);
    check_output_size(ctx, &mut report, width, height);
    if width == u64::from(ctx.analysis.width) && height == u64::from(ctx.analysis.height) {
        report.warn(
            format!("resize target {width}x{height} equals the current dimensions"),
            NO_OP_PENALTY,
        );
    }
    report
}

pub fn check_crop(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let field = |name: &str| number_param(ctx.params, name).map(|v| v as u64);
    let (Some(x), Some(y), Some(width), Some(height)) =
        (field("x"), field("y"), field("width"), field("height"))
    else {
        return report;
    };
    let (image_width, image_height) = ctx.analysis.dimensions();
    if x + width > u64::from(image_width) || y + height > u64::from(image_height) {
        report.fail(GroundTruthError::OutsideImage {
            x,
            y,
            width,
            height,
            image_width,
            image_height,
        });
    } else if x == 0
        && y == 0
        && width == u64::from(image_width)
        && height == u64::from(image_height)
    {
        report.warn(
            String::from("crop rectangle covers the full image"),
            NO_OP_PENALTY,
        );
    }
    report
}

pub fn check_extract_palette(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let measured = ctx.analysis.dominant_colors.len();
    if let Some(count) = ctx.schema.number_or_default(ctx.params, "count") {
        if count as usize > measured {
            report.warn(
                format!("requested {count} colors but only {measured} dominant colors were measured"),
                MINOR_PENALTY,
            );
        }
    }
    report
}

pub fn check_sample_color(ctx: &PlausibilityContext<'_>) -> PlausibilityReport {
    let mut report = PlausibilityReport::default();
    let (Some(x), Some(y)) = (
        number_param(ctx.params, "x"),
        number_param(ctx.params, "y"),
    ) else {
        return report;
    };
    let (x, y) = (x as u64, y as u64);
    let (image_width, image_height) = ctx.analysis.dimensions();
    if x >= u64::from(image_width) || y >= u64::from(image_height) {
        report.fail(GroundTruthError::OutsideImage {
            x,
            y,
            width: 1,
            height: 1,
            image_width,
            image_height,
        });
    }
    report
}

/// Returns the nearest measured color when `color` is close but not a match.
fn check_color_presence(
    ctx: &PlausibilityContext<'_>,
    report: &mut PlausibilityReport,
    param: &str,
    color: Rgb,
) -> Option<Rgb> {
    let Some((nearest, distance)) = ctx.analysis.nearest_color(color) else {
        report.fail(GroundTruthError::ColorNotFound {
            param: param.to_string(),
            color: color.to_hex(),
            nearest_distance: crate::analysis::color::MAX_RGB_DISTANCE,
        });
        return None;
    };
    debug!(param, color = %color.to_hex(), nearest = %nearest.hex, distance, "color presence");
    if distance <= ctx.settings.match_distance {
        return None;
    }
    if distance <= ctx.settings.close_distance {
        report.warn(
            format!(
                "color {} ({param}) is not an exact match; nearest measured color {} at distance {distance:.1}",
                color.to_hex(),
                nearest.hex
            ),
            NEAR_MATCH_PENALTY,
        );
        return Some(nearest.rgb());
    }
    report.fail(GroundTruthError::ColorNotFound {
        param: param.to_string(),
        color: color.to_hex(),
        nearest_distance: round_to_1(distance),
    });
    None
}

fn check_tolerance_against_noise(ctx: &PlausibilityContext<'_>, report: &mut PlausibilityReport) {
    let Some(tolerance) = ctx.schema.number_or_default(ctx.params, "tolerance") else {
        return;
    };
    let minimum = (ctx.analysis.noise_level * TOLERANCE_PER_NOISE).ceil();
    if tolerance < minimum {
        report.warn(
            format!(
                "tolerance {tolerance} may be too tight for measured noise level {:.1}; at least {minimum} is recommended",
                ctx.analysis.noise_level
            ),
            TIGHT_TOLERANCE_PENALTY,
        );
        report.adjustments.insert(
            String::from("tolerance"),
            json_number(ctx.schema.clamp_number("tolerance", minimum)),
        );
    }
}

fn check_coverage(ctx: &PlausibilityContext<'_>, report: &mut PlausibilityReport, targets: &[Rgb]) {
    if targets.is_empty() {
        return;
    }
    let tolerance = ctx
        .schema
        .number_or_default(ctx.params, "tolerance")
        .unwrap_or(0.0);
    let radius = tolerance_radius(tolerance).max(ctx.settings.match_distance);
    let coverage = ctx
        .analysis
        .dominant_colors
        .iter()
        .filter(|c| targets.iter().any(|t| c.rgb().distance(*t) <= radius))
        .map(|c| c.pixel_fraction)
        .sum::<f64>()
        * 100.0;
    debug!(coverage, radius, "estimated coverage");
    if coverage > ctx.settings.max_coverage_percent {
        report.fail(GroundTruthError::ExcessiveCoverage {
            coverage: round_to_1(coverage),
            max: ctx.settings.max_coverage_percent,
        });
    }
}

fn check_output_size(
    ctx: &PlausibilityContext<'_>,
    report: &mut PlausibilityReport,
    width: u64,
    height: u64,
) {
    let pixels = width.saturating_mul(height);
    if pixels > ctx.settings.max_output_pixels {
        report.fail(GroundTruthError::OutputTooLarge {
            width,
            height,
            pixels,
            max_pixels: ctx.settings.max_output_pixels,
        });
    }
}

fn round_to_1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
