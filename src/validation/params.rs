use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::plausibility::{PlausibilityContext, PlausibilityReport};
use crate::analysis::ImageAnalysis;
use crate::error::{SchemaError, ValidationError};
use crate::history::{find_similar_successes, parameter_distance, SharedHistoryStore};
use crate::settings::GuardSettings;
use crate::tools::schema::{json_number, number_param};
use crate::tools::{registry, ToolCallProposal, ToolSpec};

/// Normalized distance under which a past success counts as the same pattern.
pub const SIMILAR_RADIUS: f64 = 0.1;
pub const FAR_FROM_CENTROID: f64 = 0.35;
pub const NEAR_CENTROID: f64 = 0.2;

const FAR_CONFIDENCE: f64 = 70.0;
const DRIFT_CONFIDENCE: f64 = 85.0;
const FAILING_PATTERN_CONFIDENCE: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceBreakdown {
    pub schema: f64,
    pub ground_truth: f64,
    pub historical: f64,
}

/// Pre-execution verdict for one proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub tool_name: String,
    pub is_valid: bool,
    pub confidence: f64,
    pub breakdown: ConfidenceBreakdown,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    /// Full parameter set with suggested changes applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_parameters: Option<Map<String, Value>>,
    pub reasoning: String,
}

impl ValidationResult {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    fn schema_failure(tool_name: &str, errors: Vec<SchemaError>, warnings: Vec<String>) -> Self {
        let errors = errors
            .into_iter()
            .map(ValidationError::from)
            .collect::<Vec<_>>();
        let reasoning = format!("{tool_name}: schema check failed: {}", join_errors(&errors));
        Self {
            tool_name: tool_name.to_string(),
            is_valid: false,
            confidence: 0.0,
            breakdown: ConfidenceBreakdown {
                schema: 0.0,
                ground_truth: 0.0,
                historical: 0.0,
            },
            errors,
            warnings,
            adjusted_parameters: None,
            reasoning,
        }
    }
}

struct HistoricalCheck {
    confidence: f64,
    warnings: Vec<String>,
    adjustments: Map<String, Value>,
}

impl Default for HistoricalCheck {
    fn default() -> Self {
        Self {
            confidence: 100.0,
            warnings: Vec::new(),
            adjustments: Map::new(),
        }
    }
}

/// Gate 1: schema, ground truth, then history. Read-only against the store.
#[derive(Clone)]
pub struct ParameterValidator {
    settings: GuardSettings,
    history: SharedHistoryStore,
}

impl ParameterValidator {
    pub fn new(settings: GuardSettings, history: SharedHistoryStore) -> Self {
        Self { settings, history }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn validate(&self, proposal: &ToolCallProposal, analysis: &ImageAnalysis) -> ValidationResult {
        let tool_name = proposal.tool_name.trim();
        let Some(spec) = registry().get(tool_name) else {
            return ValidationResult::schema_failure(
                tool_name,
                vec![SchemaError::UnknownTool {
                    tool: tool_name.to_string(),
                }],
                Vec::new(),
            );
        };
        let params = &proposal.parameters;

        let schema = spec.schema.check(params);
        if !schema.passed() {
            debug!(tool = spec.name, errors = schema.errors.len(), "schema check failed");
            return ValidationResult::schema_failure(spec.name, schema.errors, schema.warnings);
        }
        let mut warnings = schema.warnings;

        let report: PlausibilityReport = (spec.plausibility)(&PlausibilityContext {
            params,
            analysis,
            settings: &self.settings,
            schema: &spec.schema,
        });
        warnings.extend(report.warnings.iter().cloned());
        if !report.errors.is_empty() {
            let errors = report
                .errors
                .into_iter()
                .map(ValidationError::from)
                .collect::<Vec<_>>();
            debug!(tool = spec.name, errors = errors.len(), "ground-truth check failed");
            let reasoning = format!("{}: {}", spec.name, join_errors(&errors));
            return ValidationResult {
                tool_name: spec.name.to_string(),
                is_valid: false,
                confidence: 0.0,
                breakdown: ConfidenceBreakdown {
                    schema: 100.0,
                    ground_truth: 0.0,
                    historical: 0.0,
                },
                errors,
                warnings,
                adjusted_parameters: None,
                reasoning,
            };
        }

        let historical = self.historical_check(spec, params);
        warnings.extend(historical.warnings);

        let mut adjustments = report.adjustments;
        for (key, value) in historical.adjustments {
            adjustments.entry(key).or_insert(value);
        }
        let adjusted_parameters = if adjustments.is_empty() {
            None
        } else {
            let mut merged = params.clone();
            merged.extend(adjustments);
            (merged != *params).then_some(merged)
        };

        let confidence = 100.0_f64
            .min(report.confidence)
            .min(historical.confidence);
        let reasoning = if warnings.is_empty() {
            format!(
                "{}: parameters are consistent with the image (confidence {confidence:.0})",
                spec.name
            )
        } else {
            format!(
                "{}: parameters accepted with {} warning(s) (confidence {confidence:.0}): {}",
                spec.name,
                warnings.len(),
                warnings.join("; ")
            )
        };
        debug!(
            tool = spec.name,
            confidence,
            ground_truth = report.confidence,
            historical = historical.confidence,
            "parameters validated"
        );

        ValidationResult {
            tool_name: spec.name.to_string(),
            is_valid: true,
            confidence,
            breakdown: ConfidenceBreakdown {
                schema: 100.0,
                ground_truth: report.confidence,
                historical: historical.confidence,
            },
            errors: Vec::new(),
            warnings,
            adjusted_parameters,
            reasoning,
        }
    }

    fn historical_check(&self, spec: &ToolSpec, params: &Map<String, Value>) -> HistoricalCheck {
        let mut out = HistoricalCheck::default();
        let window = self.settings.history_window;
        let min_samples = self.settings.min_history_samples.max(1);

        let successes = match self.history.successful_for_tool(spec.name, window) {
            Ok(records) => records,
            Err(err) => {
                warn!(tool = spec.name, error = %err, "history lookup failed");
                out.warnings
                    .push(format!("history unavailable, historical check skipped: {err}"));
                return out;
            }
        };

        if successes.len() < min_samples {
            if successes.is_empty() {
                let failures = self
                    .history
                    .recent_for_tool(spec.name, window)
                    .map(|records| records.iter().filter(|r| !r.success).count())
                    .unwrap_or(0);
                if failures >= min_samples {
                    out.warnings.push(format!(
                        "none of the last {failures} {} runs succeeded",
                        spec.name
                    ));
                    out.confidence = FAILING_PATTERN_CONFIDENCE;
                }
            }
            return out;
        }

        let centroid = numeric_centroid(spec, &successes);
        let Some(deviation) = parameter_distance(spec, params, &centroid) else {
            return out;
        };
        if !find_similar_successes(&successes, spec, params, SIMILAR_RADIUS).is_empty() {
            debug!(tool = spec.name, deviation, "matches a known successful pattern");
            return out;
        }

        if deviation > FAR_FROM_CENTROID {
            out.warnings.push(format!(
                "parameters deviate from the historical success pattern (distance {deviation:.2}); suggested values nudged toward it"
            ));
            out.confidence = FAR_CONFIDENCE;
            for (name, target) in &centroid {
                let (Some(target), Some(current)) = (
                    target.as_f64(),
                    spec.schema.number_or_default(params, name.as_str()),
                ) else {
                    continue;
                };
                let nudged = spec
                    .schema
                    .clamp_number(name.as_str(), round_to_2(current + (target - current) / 2.0));
                if nudged != current {
                    out.adjustments.insert(name.clone(), json_number(nudged));
                }
            }
        } else if deviation > NEAR_CENTROID {
            out.confidence = DRIFT_CONFIDENCE;
        }
        out
    }
}

/// Mean of each bounded numeric parameter over the given records.
fn numeric_centroid(
    spec: &ToolSpec,
    records: &[crate::history::ExecutionRecord],
) -> Map<String, Value> {
    let mut centroid = Map::new();
    for param in &spec.schema.params {
        if param.bounds().is_none() {
            continue;
        }
        let values = records
            .iter()
            .filter_map(|r| {
                number_param(&r.parameters, param.name)
                    .or(param.default)
            })
            .collect::<Vec<_>>();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        centroid.insert(param.name.to_string(), Value::from(mean));
    }
    centroid
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn round_to_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{DominantColor, Rgb};
    use crate::error::{GroundTruthError, HistoryError};
    use crate::history::{
        ExecutionRecord, HistoryStore, InMemoryHistoryStore, ResultMetrics, TerminalState,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn analysis() -> ImageAnalysis {
        ImageAnalysis {
            width: 100,
            height: 100,
            dominant_colors: vec![
                DominantColor::new(Rgb::new(255, 255, 255), 0.6),
                DominantColor::new(Rgb::new(255, 0, 0), 0.4),
            ],
            has_transparency: false,
            sharpness: 10.0,
            noise_level: 0.0,
            dpi: 72.0,
            is_print_ready: false,
            confidence: 100.0,
            digest: String::from("test"),
        }
    }

    fn proposal(tool: &str, params: Value) -> ToolCallProposal {
        ToolCallProposal::from_value(tool, params)
    }

    fn validator(history: SharedHistoryStore) -> ParameterValidator {
        ParameterValidator::new(GuardSettings::default(), history)
    }

    fn accepted(tolerance: f64) -> ExecutionRecord {
        ExecutionRecord::new(
            "remove_color",
            json!({"colors": ["#ff0000"], "tolerance": tolerance})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            TerminalState::Accepted,
            1,
            90.0,
            ResultMetrics::default(),
            analysis(),
        )
    }

    struct BrokenHistory;

    impl HistoryStore for BrokenHistory {
        fn append(&self, _record: &ExecutionRecord) -> Result<(), HistoryError> {
            Err(HistoryError::Poisoned)
        }

        fn recent_for_tool(&self, _: &str, _: usize) -> Result<Vec<ExecutionRecord>, HistoryError> {
            Err(HistoryError::Poisoned)
        }

        fn successful_for_tool(
            &self,
            _: &str,
            _: usize,
        ) -> Result<Vec<ExecutionRecord>, HistoryError> {
            Err(HistoryError::Poisoned)
        }

        fn len(&self) -> Result<usize, HistoryError> {
            Err(HistoryError::Poisoned)
        }
    }

    #[test]
    fn unknown_tool_is_a_schema_error() {
        let result = validator(InMemoryHistoryStore::shared())
            .validate(&proposal("sharpen", json!({})), &analysis());
        assert!(!result.is_valid);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error_messages(), vec![String::from("unknown tool 'sharpen'")]);
    }

    #[test]
    fn out_of_bounds_forces_zero_confidence() {
        let result = validator(InMemoryHistoryStore::shared()).validate(
            &proposal("remove_color", json!({"colors": ["#ff0000"], "tolerance": 120})),
            &analysis(),
        );
        assert!(!result.is_valid);
        assert_eq!(result.confidence, 0.0);
        assert!(result.error_messages()[0].contains("tolerance"));
    }

    #[test]
    fn missing_color_is_rejected_with_distance() {
        let result = validator(InMemoryHistoryStore::shared()).validate(
            &proposal("remove_color", json!({"colors": ["#000000"]})),
            &analysis(),
        );
        assert!(!result.is_valid);
        assert_eq!(result.confidence, 0.0);
        assert!(matches!(
            result.errors.as_slice(),
            [ValidationError::GroundTruth(GroundTruthError::ColorNotFound { .. })]
        ));
        assert!(result.reasoning.contains("nearest distance 255.0"));
    }

    #[test]
    fn valid_proposal_with_empty_history_is_fully_trusted() {
        let result = validator(InMemoryHistoryStore::shared()).validate(
            &proposal("remove_color", json!({"colors": ["#ff0000"], "tolerance": 10})),
            &analysis(),
        );
        assert!(result.is_valid);
        assert_eq!(result.confidence, 100.0);
        assert!(result.adjusted_parameters.is_none());
    }

    #[test]
    fn near_match_color_is_snapped_in_adjusted_parameters() {
        let result = validator(InMemoryHistoryStore::shared()).validate(
            &proposal("remove_color", json!({"colors": ["#dc0000"]})),
            &analysis(),
        );
        assert!(result.is_valid);
        assert_eq!(result.confidence, 85.0);
        let adjusted = result.adjusted_parameters.expect("snapped colors");
        assert_eq!(adjusted["colors"], json!(["#ff0000"]));
    }

    #[test]
    fn far_from_history_warns_and_nudges() {
        let store = InMemoryHistoryStore::new();
        for tolerance in [10.0, 12.0, 14.0] {
            store.append(&accepted(tolerance)).expect("append");
        }
        let result = validator(Arc::new(store)).validate(
            &proposal("remove_color", json!({"colors": ["#ff0000"], "tolerance": 80})),
            &analysis(),
        );
        assert!(result.is_valid);
        assert_eq!(result.confidence, 70.0);
        assert_eq!(result.breakdown.historical, 70.0);
        let adjusted = result.adjusted_parameters.expect("nudged tolerance");
        assert_eq!(adjusted["tolerance"], json!(46));
    }

    #[test]
    fn broken_history_only_warns() {
        let result = validator(Arc::new(BrokenHistory)).validate(
            &proposal("remove_color", json!({"colors": ["#ff0000"]})),
            &analysis(),
        );
        assert!(result.is_valid);
        assert_eq!(result.confidence, 100.0);
        assert!(result.warnings[0].starts_with("history unavailable"));
    }

    #[test]
    fn validation_is_idempotent() {
        let v = validator(InMemoryHistoryStore::shared());
        let p = proposal("recolor", json!({"from_color": "#ee1111", "to_color": "#00ff00"}));
        assert_eq!(v.validate(&p, &analysis()), v.validate(&p, &analysis()));
    }
}
