use serde::Serialize;

use crate::analysis::clamp_percent;
use crate::validation::{ResultValidation, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConfidenceBand {
    pub fn from_score(value: f64) -> Self {
        match value {
            v if v >= 95.0 => Self::Excellent,
            v if v >= 80.0 => Self::Good,
            v if v >= 70.0 => Self::Fair,
            v if v >= 50.0 => Self::Poor,
            _ => Self::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceScore {
    pub value: f64,
    pub band: ConfidenceBand,
}

impl ConfidenceScore {
    pub fn new(value: f64) -> Self {
        let value = clamp_percent(value);
        Self {
            value,
            band: ConfidenceBand::from_score(value),
        }
    }
}

/// Final confidence is the weaker of the two gates.
pub fn score(validation: &ValidationResult, result: &ResultValidation) -> ConfidenceScore {
    ConfidenceScore::new(validation.confidence.min(result.quality_score))
}
