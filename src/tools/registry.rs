use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::{Map, Value};

use super::schema::{enum_text, number_param, ParamSpec, ToolSchema};
use super::{ExpectedOperationProfile, ToolCategory, ToolSpec};
use crate::validation::plausibility;

pub const TRANSPARENCY_BAND: (f64, f64) = (1.0, 95.0);
pub const TRANSPARENCY_BAND_MARGIN: f64 = 0.5;
pub const REMAP_MIN_CHANGE: f64 = 5.0;
pub const REMAP_BAND_MARGIN: f64 = 1.0;
pub const MAX_SIDE: f64 = 16_384.0;

#[derive(Debug)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name.trim())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    fn builtin() -> Self {
        let tools = builtin_tools()
            .into_iter()
            .map(|spec| (spec.name, spec))
            .collect();
        Self { tools }
    }
}

/// Process-wide tool table, built once on first use and read-only afterwards.
pub fn registry() -> &'static ToolRegistry {
    static REGISTRY: OnceLock<ToolRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ToolRegistry::builtin)
}

fn builtin_tools() -> Vec<ToolSpec> {
    let (band_min, band_max) = TRANSPARENCY_BAND;
    vec![
        ToolSpec {
            name: "remove_color",
            category: ToolCategory::Transparency,
            description: "Make every pixel close to the listed colors transparent.",
            schema: ToolSchema::new(vec![
                ParamSpec::color_list("colors", 1, 8),
                ParamSpec::number("tolerance", 0.0, 100.0).with_default(10.0),
                ParamSpec::number("feather", 0.0, 10.0).optional(),
            ]),
            profile: ExpectedOperationProfile::transparency(
                band_min,
                band_max,
                TRANSPARENCY_BAND_MARGIN,
            ),
            plausibility: plausibility::check_remove_color,
            target_dimensions: None,
        },
        ToolSpec {
            name: "remove_background",
            category: ToolCategory::Transparency,
            description: "Cut the subject out and make the background transparent.",
            schema: ToolSchema::new(vec![
                ParamSpec::choice("mode", &["auto", "subject", "edge"]).optional(),
                ParamSpec::number("tolerance", 0.0, 100.0).optional(),
            ]),
            profile: ExpectedOperationProfile::transparency(
                band_min,
                band_max,
                TRANSPARENCY_BAND_MARGIN,
            ),
            plausibility: plausibility::check_remove_background,
            target_dimensions: None,
        },
        ToolSpec {
            name: "cut_texture",
            category: ToolCategory::Transparency,
            description: "Remove a repeating texture color, leaving transparency behind.",
            schema: ToolSchema::new(vec![
                ParamSpec::color("texture_color"),
                ParamSpec::number("tolerance", 0.0, 100.0).with_default(10.0),
            ]),
            profile: ExpectedOperationProfile::transparency(
                band_min,
                band_max,
                TRANSPARENCY_BAND_MARGIN,
            ),
            plausibility: plausibility::check_cut_texture,
            target_dimensions: None,
        },
        ToolSpec {
            name: "recolor",
            category: ToolCategory::ColorRemap,
            description: "Replace one color with another.",
            schema: ToolSchema::new(vec![
                ParamSpec::color("from_color"),
                ParamSpec::color("to_color"),
                ParamSpec::number("tolerance", 0.0, 100.0).with_default(10.0),
            ]),
            profile: ExpectedOperationProfile::color_remap(REMAP_MIN_CHANGE, REMAP_BAND_MARGIN),
            plausibility: plausibility::check_recolor,
            target_dimensions: Some(same_dimensions),
        },
        ToolSpec {
            name: "upscale",
            category: ToolCategory::Enhancement,
            description: "Enlarge the image with a super-resolution model.",
            schema: ToolSchema::new(vec![
                ParamSpec::number("scale_factor", 1.0, 8.0),
                ParamSpec::choice("model", &["standard", "photo", "anime"]).optional(),
            ]),
            profile: ExpectedOperationProfile::enhancement(),
            plausibility: plausibility::check_upscale,
            target_dimensions: Some(upscaled_dimensions),
        },
        ToolSpec {
            name: "crop",
            category: ToolCategory::Structural,
            description: "Keep only the given rectangle.",
            schema: ToolSchema::new(vec![
                ParamSpec::integer("x", 0.0, MAX_SIDE),
                ParamSpec::integer("y", 0.0, MAX_SIDE),
                ParamSpec::integer("width", 1.0, MAX_SIDE),
                ParamSpec::integer("height", 1.0, MAX_SIDE),
            ]),
            profile: ExpectedOperationProfile::structural(),
            plausibility: plausibility::check_crop,
            target_dimensions: Some(declared_dimensions),
        },
        ToolSpec {
            name: "rotate",
            category: ToolCategory::Structural,
            description: "Rotate clockwise by a right angle.",
            schema: ToolSchema::new(vec![ParamSpec::choice("degrees", &["90", "180", "270"])]),
            profile: ExpectedOperationProfile::structural(),
            plausibility: plausibility::check_nothing,
            target_dimensions: Some(rotated_dimensions),
        },
        ToolSpec {
            name: "resize",
            category: ToolCategory::Structural,
            description: "Resample to exact pixel dimensions.",
            schema: ToolSchema::new(vec![
                ParamSpec::integer("width", 1.0, MAX_SIDE),
                ParamSpec::integer("height", 1.0, MAX_SIDE),
            ]),
            profile: ExpectedOperationProfile::structural(),
            plausibility: plausibility::check_resize,
            target_dimensions: Some(declared_dimensions),
        },
        ToolSpec {
            name: "extract_palette",
            category: ToolCategory::InfoOnly,
            description: "Report the main colors of the image.",
            schema: ToolSchema::new(vec![ParamSpec::integer("count", 1.0, 32.0).with_default(6.0)]),
            profile: ExpectedOperationProfile::info_only(),
            plausibility: plausibility::check_extract_palette,
            target_dimensions: None,
        },
        ToolSpec {
            name: "sample_color",
            category: ToolCategory::InfoOnly,
            description: "Report the color at one pixel.",
            schema: ToolSchema::new(vec![
                ParamSpec::integer("x", 0.0, MAX_SIDE),
                ParamSpec::integer("y", 0.0, MAX_SIDE),
            ]),
            profile: ExpectedOperationProfile::info_only(),
            plausibility: plausibility::check_sample_color,
            target_dimensions: None,
        },
    ]
}

fn same_dimensions(_params: &Map<String, Value>, before: (u32, u32)) -> Option<(u32, u32)> {
    Some(before)
}

fn declared_dimensions(params: &Map<String, Value>, _before: (u32, u32)) -> Option<(u32, u32)> {
    let width = number_param(params, "width")?;
    let height = number_param(params, "height")?;
    Some((width as u32, height as u32))
}

fn rotated_dimensions(params: &Map<String, Value>, before: (u32, u32)) -> Option<(u32, u32)> {
    let degrees = params.get("degrees").and_then(enum_text)?;
    match degrees.as_str() {
        "90" | "270" => Some((before.1, before.0)),
        "180" => Some(before),
        _ => None,
    }
}

pub(crate) fn upscaled_dimensions(
    params: &Map<String, Value>,
    before: (u32, u32),
) -> Option<(u32, u32)> {
    let factor = number_param(params, "scale_factor")?;
    let scale = |side: u32| (f64::from(side) * factor).round().min(f64::from(u32::MAX)) as u32;
    Some((scale(before.0), scale(before.1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test params must be an object")
    }

    #[test]
    fn registry_knows_every_builtin_tool_once() {
        let names = registry().names().collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "crop",
                "cut_texture",
                "extract_palette",
                "recolor",
                "remove_background",
                "remove_color",
                "resize",
                "rotate",
                "sample_color",
                "upscale",
            ]
        );
        assert!(registry().get("sharpen").is_none());
        assert!(registry().get(" remove_color ").is_some());
    }

    #[test]
    fn info_only_tools_are_flagged_in_their_profiles() {
        for spec in registry().iter() {
            assert_eq!(
                spec.profile.info_only,
                spec.category == ToolCategory::InfoOnly,
                "{}",
                spec.name
            );
        }
    }

    #[test]
    fn structural_tools_declare_target_dimensions() {
        let reg = registry();
        let rotate = reg.get("rotate").expect("rotate is registered");
        assert_eq!(
            rotate.expected_dimensions(&params(json!({"degrees": 90})), (40, 10)),
            Some((10, 40))
        );
        assert_eq!(
            rotate.expected_dimensions(&params(json!({"degrees": "180"})), (40, 10)),
            Some((40, 10))
        );
        let crop = reg.get("crop").expect("crop is registered");
        assert_eq!(
            crop.expected_dimensions(
                &params(json!({"x": 0, "y": 0, "width": 12, "height": 7})),
                (40, 10)
            ),
            Some((12, 7))
        );
        let upscale = reg.get("upscale").expect("upscale is registered");
        assert_eq!(
            upscale.expected_dimensions(&params(json!({"scale_factor": 2.5})), (10, 4)),
            Some((25, 10))
        );
    }
}
