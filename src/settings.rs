use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const SETTINGS_PATH_ENV: &str = "KROMA_GUARD_SETTINGS";
pub const HISTORY_DB_ENV: &str = "KROMA_GUARD_HISTORY_DB";
pub const DEFAULT_HISTORY_DB: &str = "var/guard/history.db";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardSettings {
    pub acceptance_threshold: f64,
    pub max_attempts: u32,
    pub match_distance: f64,
    pub close_distance: f64,
    pub max_output_pixels: u64,
    pub max_coverage_percent: f64,
    pub pixel_change_threshold: f64,
    pub comparison_sample_limit: u64,
    pub history_window: usize,
    pub min_history_samples: usize,
    pub apply_suggested_parameters: bool,
    pub request_timeout_ms: Option<u64>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            acceptance_threshold: 70.0,
            max_attempts: 3,
            match_distance: 30.0,
            close_distance: 60.0,
            max_output_pixels: 16_777_216,
            max_coverage_percent: 95.0,
            pixel_change_threshold: 10.0,
            comparison_sample_limit: 4_000_000,
            history_window: 50,
            min_history_samples: 3,
            apply_suggested_parameters: true,
            request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuardSettingsOverlay {
    pub acceptance_threshold: Option<f64>,
    pub max_attempts: Option<u32>,
    pub match_distance: Option<f64>,
    pub close_distance: Option<f64>,
    pub max_output_pixels: Option<u64>,
    pub max_coverage_percent: Option<f64>,
    pub pixel_change_threshold: Option<f64>,
    pub comparison_sample_limit: Option<u64>,
    pub history_window: Option<usize>,
    pub min_history_samples: Option<usize>,
    pub apply_suggested_parameters: Option<bool>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardSettingsError {
    #[error("failed to read guard settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse guard settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse guard settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("guard settings root must be an object")]
    RootMustBeObject,
    #[error("guard settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("guard settings field '{field}' has invalid value: {message}")]
    InvalidValue { field: String, message: String },
}

impl GuardSettingsOverlay {
    /// Applies the overlay onto `base` and checks the result for consistency.
    pub fn apply(&self, base: &GuardSettings) -> Result<GuardSettings, GuardSettingsError> {
        let settings = GuardSettings {
            acceptance_threshold: self
                .acceptance_threshold
                .unwrap_or(base.acceptance_threshold),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            match_distance: self.match_distance.unwrap_or(base.match_distance),
            close_distance: self.close_distance.unwrap_or(base.close_distance),
            max_output_pixels: self.max_output_pixels.unwrap_or(base.max_output_pixels),
            max_coverage_percent: self
                .max_coverage_percent
                .unwrap_or(base.max_coverage_percent),
            pixel_change_threshold: self
                .pixel_change_threshold
                .unwrap_or(base.pixel_change_threshold),
            comparison_sample_limit: self
                .comparison_sample_limit
                .unwrap_or(base.comparison_sample_limit),
            history_window: self.history_window.unwrap_or(base.history_window),
            min_history_samples: self.min_history_samples.unwrap_or(base.min_history_samples),
            apply_suggested_parameters: self
                .apply_suggested_parameters
                .unwrap_or(base.apply_suggested_parameters),
            request_timeout_ms: self.request_timeout_ms.or(base.request_timeout_ms),
        };
        validate_guard_settings(&settings)?;
        Ok(settings)
    }
}

pub fn validate_guard_settings(settings: &GuardSettings) -> Result<(), GuardSettingsError> {
    let invalid = |field: &str, message: &str| GuardSettingsError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    };
    if !(0.0..=100.0).contains(&settings.acceptance_threshold) {
        return Err(invalid("acceptance_threshold", "must be within 0..=100"));
    }
    if settings.max_attempts == 0 {
        return Err(invalid("max_attempts", "must be at least 1"));
    }
    if settings.match_distance < 0.0 {
        return Err(invalid("match_distance", "must not be negative"));
    }
    if settings.match_distance > settings.close_distance {
        return Err(invalid("close_distance", "must not be below match_distance"));
    }
    if settings.max_output_pixels == 0 {
        return Err(invalid("max_output_pixels", "must be positive"));
    }
    if !(0.0..=100.0).contains(&settings.max_coverage_percent) {
        return Err(invalid("max_coverage_percent", "must be within 0..=100"));
    }
    if settings.pixel_change_threshold < 0.0 {
        return Err(invalid("pixel_change_threshold", "must not be negative"));
    }
    if settings.comparison_sample_limit == 0 {
        return Err(invalid("comparison_sample_limit", "must be positive"));
    }
    if settings.request_timeout_ms == Some(0) {
        return Err(invalid("request_timeout_ms", "must be positive when set"));
    }
    Ok(())
}

/// Resolves the settings file: explicit path first, then `KROMA_GUARD_SETTINGS`.
pub fn resolve_settings_path(explicit_path: Option<&str>) -> Option<PathBuf> {
    explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var(SETTINGS_PATH_ENV)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
}

pub fn resolve_history_db_path(explicit_path: Option<&str>) -> PathBuf {
    explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var(HISTORY_DB_ENV)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DB))
}

/// Loads app and project layers plus explicit overrides onto the defaults.
pub fn load_guard_settings(
    app_path: Option<&Path>,
    project_path: Option<&Path>,
    overrides: &GuardSettingsOverlay,
) -> Result<GuardSettings, GuardSettingsError> {
    let app = match app_path {
        Some(path) => load_guard_settings_overlay(path)?,
        None => GuardSettingsOverlay::default(),
    };
    let project = match project_path {
        Some(path) => load_guard_settings_overlay(path)?,
        None => GuardSettingsOverlay::default(),
    };
    merge_guard_settings_overlays(&app, &project, overrides).apply(&GuardSettings::default())
}

pub fn load_guard_settings_overlay(
    path: &Path,
) -> Result<GuardSettingsOverlay, GuardSettingsError> {
    if !path.exists() {
        return Ok(GuardSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| GuardSettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let is_toml = path
        .extension()
        .and_then(|v| v.to_str())
        .is_some_and(|v| v.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        let value = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
            GuardSettingsError::ParseToml {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?;
        serde_json::to_value(value).map_err(|error| GuardSettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?
    } else {
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| {
            GuardSettingsError::ParseJson {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?
    };
    parse_guard_settings_overlay_json(&parsed)
}

pub fn merge_guard_settings_overlays(
    app: &GuardSettingsOverlay,
    project: &GuardSettingsOverlay,
    overrides: &GuardSettingsOverlay,
) -> GuardSettingsOverlay {
    GuardSettingsOverlay {
        acceptance_threshold: overrides
            .acceptance_threshold
            .or(project.acceptance_threshold)
            .or(app.acceptance_threshold),
        max_attempts: overrides
            .max_attempts
            .or(project.max_attempts)
            .or(app.max_attempts),
        match_distance: overrides
            .match_distance
            .or(project.match_distance)
            .or(app.match_distance),
        close_distance: overrides
            .close_distance
            .or(project.close_distance)
            .or(app.close_distance),
        max_output_pixels: overrides
            .max_output_pixels
            .or(project.max_output_pixels)
            .or(app.max_output_pixels),
        max_coverage_percent: overrides
            .max_coverage_percent
            .or(project.max_coverage_percent)
            .or(app.max_coverage_percent),
        pixel_change_threshold: overrides
            .pixel_change_threshold
            .or(project.pixel_change_threshold)
            .or(app.pixel_change_threshold),
        comparison_sample_limit: overrides
            .comparison_sample_limit
            .or(project.comparison_sample_limit)
            .or(app.comparison_sample_limit),
        history_window: overrides
            .history_window
            .or(project.history_window)
            .or(app.history_window),
        min_history_samples: overrides
            .min_history_samples
            .or(project.min_history_samples)
            .or(app.min_history_samples),
        apply_suggested_parameters: overrides
            .apply_suggested_parameters
            .or(project.apply_suggested_parameters)
            .or(app.apply_suggested_parameters),
        request_timeout_ms: overrides
            .request_timeout_ms
            .or(project.request_timeout_ms)
            .or(app.request_timeout_ms),
    }
}

pub fn parse_guard_settings_overlay_json(
    value: &Value,
) -> Result<GuardSettingsOverlay, GuardSettingsError> {
    let root = value
        .as_object()
        .ok_or(GuardSettingsError::RootMustBeObject)?;
    let guard = root
        .get("guard")
        .unwrap_or(value)
        .as_object()
        .ok_or(GuardSettingsError::RootMustBeObject)?;

    let mut out = GuardSettingsOverlay::default();
    if let Some(v) = guard.get("acceptance_threshold") {
        out.acceptance_threshold = Some(parse_f64(v, "acceptance_threshold")?);
    }
    if let Some(v) = guard.get("max_attempts") {
        let attempts = parse_u64(v, "max_attempts")?;
        out.max_attempts =
            Some(
                u32::try_from(attempts).map_err(|_| GuardSettingsError::InvalidFieldType {
                    field: String::from("max_attempts"),
                })?,
            );
    }
    if let Some(v) = guard.get("match_distance") {
        out.match_distance = Some(parse_f64(v, "match_distance")?);
    }
    if let Some(v) = guard.get("close_distance") {
        out.close_distance = Some(parse_f64(v, "close_distance")?);
    }
    if let Some(v) = guard.get("max_output_pixels") {
        out.max_output_pixels = Some(parse_u64(v, "max_output_pixels")?);
    }
    if let Some(v) = guard.get("max_coverage_percent") {
        out.max_coverage_percent = Some(parse_f64(v, "max_coverage_percent")?);
    }
    if let Some(v) = guard.get("pixel_change_threshold") {
        out.pixel_change_threshold = Some(parse_f64(v, "pixel_change_threshold")?);
    }
    if let Some(v) = guard.get("comparison_sample_limit") {
        out.comparison_sample_limit = Some(parse_u64(v, "comparison_sample_limit")?);
    }
    if let Some(v) = guard.get("history_window") {
        out.history_window = Some(parse_u64(v, "history_window")? as usize);
    }
    if let Some(v) = guard.get("min_history_samples") {
        out.min_history_samples = Some(parse_u64(v, "min_history_samples")? as usize);
    }
    if let Some(v) = guard.get("apply_suggested_parameters") {
        out.apply_suggested_parameters = Some(parse_bool(v, "apply_suggested_parameters")?);
    }
    if let Some(v) = guard.get("request_timeout_ms") {
        out.request_timeout_ms = Some(parse_u64(v, "request_timeout_ms")?);
    }
    Ok(out)
}

fn parse_f64(value: &Value, field: &str) -> Result<f64, GuardSettingsError> {
    value
        .as_f64()
        .ok_or_else(|| GuardSettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_u64(value: &Value, field: &str) -> Result<u64, GuardSettingsError> {
    value
        .as_u64()
        .ok_or_else(|| GuardSettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_bool(value: &Value, field: &str) -> Result<bool, GuardSettingsError> {
    value
        .as_bool()
        .ok_or_else(|| GuardSettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}
