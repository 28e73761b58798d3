use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, Rgba, RgbaImage};
use pretty_assertions::assert_eq;
use serde_json::json;

use kroma_guard_core::analysis::analyze;
use kroma_guard_core::error::{GroundTruthError, SchemaError, ValidationError};
use kroma_guard_core::history::InMemoryHistoryStore;
use kroma_guard_core::settings::{GuardSettings, GuardSettingsOverlay};
use kroma_guard_core::tools::ToolCallProposal;
use kroma_guard_core::validation::ParameterValidator;

fn red_and_white_png() -> Vec<u8> {
    let image = RgbaImage::from_fn(100, 100, |x, _| {
        if x < 40 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    });
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encode should succeed");
    out.into_inner()
}

fn validator(settings: GuardSettings) -> ParameterValidator {
    ParameterValidator::new(settings, Arc::new(InMemoryHistoryStore::new()))
}

#[test]
fn schema_violation_scores_zero() {
    let analysis = analyze(&red_and_white_png()).expect("analyze");
    let proposal = ToolCallProposal::from_value(
        "remove_color",
        json!({"colors": ["#ff0000"], "tolerance": 150}),
    );
    let result = validator(GuardSettings::default()).validate(&proposal, &analysis);

    assert!(!result.is_valid);
    assert_eq!(result.confidence, 0.0);
    assert!(result.errors.iter().any(|e| matches!(
        e,
        ValidationError::Schema(SchemaError::OutOfBounds { param, .. }) if param == "tolerance"
    )));
}

#[test]
fn valid_proposal_on_a_matching_image_is_fully_trusted() {
    let analysis = analyze(&red_and_white_png()).expect("analyze");
    let proposal = ToolCallProposal::from_value("remove_color", json!({"colors": ["#ff0000"]}));
    let result = validator(GuardSettings::default()).validate(&proposal, &analysis);

    assert!(result.is_valid, "{}", result.reasoning);
    assert_eq!(result.confidence, 100.0);
    assert!(result.errors.is_empty());
    assert_eq!(result.adjusted_parameters, None);
}

#[test]
fn upscale_beyond_the_output_limit_is_rejected() {
    let analysis = analyze(&red_and_white_png()).expect("analyze");
    let settings = GuardSettingsOverlay {
        max_output_pixels: Some(10_000),
        ..GuardSettingsOverlay::default()
    }
    .apply(&GuardSettings::default())
    .expect("valid settings");
    let proposal = ToolCallProposal::from_value("upscale", json!({"scale_factor": 2}));
    let result = validator(settings).validate(&proposal, &analysis);

    assert!(!result.is_valid);
    assert_eq!(result.confidence, 0.0);
    assert!(result.errors.iter().any(|e| matches!(
        e,
        ValidationError::GroundTruth(GroundTruthError::OutputTooLarge {
            width: 200,
            height: 200,
            pixels: 40_000,
            ..
        })
    )));
}

#[test]
fn near_miss_color_is_snapped_to_the_image() {
    let analysis = analyze(&red_and_white_png()).expect("analyze");
    let proposal = ToolCallProposal::from_value("remove_color", json!({"colors": ["#e00000"]}));
    let result = validator(GuardSettings::default()).validate(&proposal, &analysis);

    assert!(result.is_valid, "{}", result.reasoning);
    assert!(result.confidence < 100.0);
    let adjusted = result.adjusted_parameters.expect("snapped colors");
    assert_eq!(adjusted["colors"], json!(["#ff0000"]));
    assert!(!result.warnings.is_empty());
}
