use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaError {
    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },
    #[error("missing required parameter '{param}'")]
    MissingParameter { param: String },
    #[error("parameter '{param}' must be {expected}, got {found}")]
    TypeMismatch {
        param: String,
        expected: String,
        found: String,
    },
    #[error("parameter '{param}' = {value} is outside the allowed range [{min}, {max}]")]
    OutOfBounds {
        param: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("parameter '{param}' = '{value}' is not one of [{allowed}]")]
    NotInEnum {
        param: String,
        value: String,
        allowed: String,
    },
    #[error("parameter '{param}' has invalid color '{value}' (expected #rrggbb)")]
    InvalidColor { param: String, value: String },
    #[error("parameter '{param}' must have between {min} and {max} entries, got {len}")]
    InvalidLength {
        param: String,
        len: usize,
        min: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroundTruthError {
    #[error("color {color} ({param}) not found in image, nearest distance {nearest_distance:.1}")]
    ColorNotFound {
        param: String,
        color: String,
        nearest_distance: f64,
    },
    #[error("projected output {width}x{height} ({pixels} px) exceeds the {max_pixels} px size limit")]
    OutputTooLarge {
        width: u64,
        height: u64,
        pixels: u64,
        max_pixels: u64,
    },
    #[error("estimated coverage {coverage:.1}% exceeds the {max:.1}% limit; this would remove almost the whole image")]
    ExcessiveCoverage { coverage: f64, max: f64 },
    #[error("region at ({x}, {y}) sized {width}x{height} lies outside the {image_width}x{image_height} image")]
    OutsideImage {
        x: u64,
        y: u64,
        width: u64,
        height: u64,
        image_width: u32,
        image_height: u32,
    },
}

/// A hard pre-execution error. Either kind blocks execution of the attempt.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(untagged)]
pub enum ValidationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    GroundTruth(#[from] GroundTruthError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("tool '{tool}' is not supported by the execution gateway")]
    Unsupported { tool: String },
    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

/// Execution finished but the measured effect does not match the tool's profile.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultMismatchError {
    #[error("{which} image could not be decoded: {message}")]
    Undecodable { which: String, message: String },
    #[error("result has no transparency; the tool was expected to introduce it")]
    NoTransparency,
    #[error("only {percentage:.2}% of pixels changed (expected at least {min}%): no meaningful change")]
    NoMeaningfulChange { percentage: f64, min: f64 },
    #[error("{percentage:.2}% of pixels changed (expected at most {max}%): over-destructive, likely wrong target")]
    OverDestructive { percentage: f64, max: f64 },
    #[error("no pixels changed beyond the noise tolerance")]
    NoPixelsChanged,
    #[error("dimensions changed from {before_width}x{before_height} to {after_width}x{after_height}; the tool must preserve them")]
    DimensionsChanged {
        before_width: u32,
        before_height: u32,
        after_width: u32,
        after_height: u32,
    },
    #[error("output {after_width}x{after_height} is not larger than input {before_width}x{before_height}")]
    DimensionsNotIncreased {
        before_width: u32,
        before_height: u32,
        after_width: u32,
        after_height: u32,
    },
    #[error("output is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("image has no pixels")]
    Empty,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode history record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("history record '{id}' is corrupt: {message}")]
    Corrupt { id: String, message: String },
    #[error("history store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    GroundTruth(#[from] GroundTruthError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    ResultMismatch(#[from] ResultMismatchError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("invalid retry state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
    #[error("proposal {index} skipped: the proposal it depends on was not accepted")]
    UpstreamNotAccepted { index: usize },
    #[error("pipeline timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ground_truth_color_error_names_nearest_distance() {
        let err = GroundTruthError::ColorNotFound {
            param: String::from("colors[0]"),
            color: String::from("#0000ff"),
            nearest_distance: 95.31,
        };
        assert_eq!(
            err.to_string(),
            "color #0000ff (colors[0]) not found in image, nearest distance 95.3"
        );
    }

    #[test]
    fn validation_errors_serialize_with_kind_tag() {
        let err = ValidationError::from(SchemaError::MissingParameter {
            param: String::from("colors"),
        });
        let value = serde_json::to_value(&err).expect("error should serialize");
        assert_eq!(value, json!({"kind": "missing_parameter", "param": "colors"}));
    }
}
