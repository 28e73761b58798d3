use serde_json::{Map, Value};

use crate::error::ResultMismatchError;
use crate::tools::schema::{json_number, number_param};
use crate::tools::ToolSpec;
use crate::validation::ResultValidation;

pub const TOLERANCE_STEP: f64 = 10.0;
pub const SCALE_STEP: f64 = 1.0;
const FALLBACK_TOLERANCE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Widen,
    Narrow,
    Enlarge,
}

/// Derives the next attempt's parameters from why the last one failed.
///
/// Returns `None` when no rule applies or the rules leave the parameters
/// unchanged, e.g. a tolerance already at its bound.
pub fn derive_adjustment(
    spec: &ToolSpec,
    params: &Map<String, Value>,
    result: &ResultValidation,
) -> Option<Map<String, Value>> {
    let direction = direction_for(result)?;
    let mut next = params.clone();

    match direction {
        Direction::Widen => {
            step_tolerance(spec, &mut next, TOLERANCE_STEP);
        }
        Direction::Narrow => {
            step_tolerance(spec, &mut next, -TOLERANCE_STEP);
            if let Some(Value::Array(colors)) = next.get_mut("colors") {
                if colors.len() > 1 {
                    colors.pop();
                }
            }
        }
        Direction::Enlarge => {
            if let Some(current) = number_param(params, "scale_factor") {
                let target = spec
                    .schema
                    .clamp_number("scale_factor", (current + SCALE_STEP).floor().max(2.0));
                next.insert(String::from("scale_factor"), json_number(target));
            }
        }
    }

    (next != *params).then_some(next)
}

fn direction_for(result: &ResultValidation) -> Option<Direction> {
    for failure in &result.failures {
        match failure {
            ResultMismatchError::OverDestructive { .. } => return Some(Direction::Narrow),
            ResultMismatchError::NoMeaningfulChange { .. }
            | ResultMismatchError::NoPixelsChanged
            | ResultMismatchError::NoTransparency => return Some(Direction::Widen),
            ResultMismatchError::DimensionsNotIncreased { .. } => {
                return Some(Direction::Enlarge)
            }
            ResultMismatchError::Undecodable { .. }
            | ResultMismatchError::DimensionsChanged { .. }
            | ResultMismatchError::DimensionMismatch { .. } => {}
        }
    }
    if result.success && !result.significant_change {
        return Some(Direction::Widen);
    }
    None
}

fn step_tolerance(spec: &ToolSpec, params: &mut Map<String, Value>, step: f64) {
    if !spec.has_param("tolerance") {
        return;
    }
    let current = spec
        .schema
        .number_or_default(params, "tolerance")
        .unwrap_or(FALLBACK_TOLERANCE);
    let next = spec.schema.clamp_number("tolerance", current + step);
    params.insert(String::from("tolerance"), json_number(next));
}
