pub mod registry;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::validation::plausibility::{PlausibilityContext, PlausibilityReport};

pub use registry::{registry, ToolRegistry};
pub use schema::{ParamKind, ParamSpec, ToolSchema};

/// A model-proposed tool call. Untrusted until validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallProposal {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ToolCallProposal {
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
        }
    }

    /// Builds a proposal from a JSON object; non-object parameters become empty.
    pub fn from_value(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self::new(
            tool_name,
            parameters.as_object().cloned().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Transparency,
    ColorRemap,
    Enhancement,
    Structural,
    InfoOnly,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transparency => "transparency",
            Self::ColorRemap => "color_remap",
            Self::Enhancement => "enhancement",
            Self::Structural => "structural",
            Self::InfoOnly => "info_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionExpectation {
    /// Differing dimensions are recorded and the overlap is compared.
    Any,
    /// Output must keep the input dimensions.
    Same,
    /// Output must be strictly larger in at least one axis and smaller in none.
    Larger,
    /// Output must match dimensions derived from the call parameters.
    Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChangeBand {
    pub min: f64,
    pub max: f64,
    /// Distance outside the band that only warns instead of failing.
    pub margin: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExpectedOperationProfile {
    pub requires_transparency: bool,
    pub dimensions: DimensionExpectation,
    pub change_band: Option<ChangeBand>,
    pub info_only: bool,
    pub rewards_print_readiness: bool,
}

impl ExpectedOperationProfile {
    pub const fn transparency(min: f64, max: f64, margin: f64) -> Self {
        Self {
            requires_transparency: true,
            dimensions: DimensionExpectation::Any,
            change_band: Some(ChangeBand { min, max, margin }),
            info_only: false,
            rewards_print_readiness: false,
        }
    }

    pub const fn color_remap(min: f64, margin: f64) -> Self {
        Self {
            requires_transparency: false,
            dimensions: DimensionExpectation::Same,
            change_band: Some(ChangeBand {
                min,
                max: 100.0,
                margin,
            }),
            info_only: false,
            rewards_print_readiness: false,
        }
    }

    pub const fn enhancement() -> Self {
        Self {
            requires_transparency: false,
            dimensions: DimensionExpectation::Larger,
            change_band: None,
            info_only: false,
            rewards_print_readiness: true,
        }
    }

    pub const fn structural() -> Self {
        Self {
            requires_transparency: false,
            dimensions: DimensionExpectation::Declared,
            change_band: None,
            info_only: false,
            rewards_print_readiness: false,
        }
    }

    pub const fn info_only() -> Self {
        Self {
            requires_transparency: false,
            dimensions: DimensionExpectation::Any,
            change_band: None,
            info_only: true,
            rewards_print_readiness: false,
        }
    }
}

pub type PlausibilityCheck = fn(&PlausibilityContext<'_>) -> PlausibilityReport;
pub type TargetDimensions = fn(&Map<String, Value>, (u32, u32)) -> Option<(u32, u32)>;

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub category: ToolCategory,
    pub description: &'static str,
    pub schema: ToolSchema,
    pub profile: ExpectedOperationProfile,
    #[serde(skip)]
    pub plausibility: PlausibilityCheck,
    #[serde(skip)]
    pub target_dimensions: Option<TargetDimensions>,
}

impl ToolSpec {
    pub fn expected_dimensions(
        &self,
        params: &Map<String, Value>,
        before: (u32, u32),
    ) -> Option<(u32, u32)> {
        self.target_dimensions.and_then(|f| f(params, before))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.schema.param(name).is_some()
    }
}
