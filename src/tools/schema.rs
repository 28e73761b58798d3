use serde::Serialize;
use serde_json::{Map, Value};

use crate::analysis::Rgb;
use crate::error::SchemaError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Number { min: f64, max: f64, integer: bool },
    Enum { values: &'static [&'static str] },
    Color,
    ColorList { min_len: usize, max_len: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

impl ParamSpec {
    pub const fn number(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Number {
                min,
                max,
                integer: false,
            },
            required: true,
            default: None,
        }
    }

    pub const fn integer(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Number {
                min,
                max,
                integer: true,
            },
            required: true,
            default: None,
        }
    }

    pub const fn choice(name: &'static str, values: &'static [&'static str]) -> Self {
        Self {
            name,
            kind: ParamKind::Enum { values },
            required: true,
            default: None,
        }
    }

    pub const fn color(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Color,
            required: true,
            default: None,
        }
    }

    pub const fn color_list(name: &'static str, min_len: usize, max_len: usize) -> Self {
        Self {
            name,
            kind: ParamKind::ColorList { min_len, max_len },
            required: true,
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: f64) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn bounds(&self) -> Option<(f64, f64, bool)> {
        match self.kind {
            ParamKind::Number { min, max, integer } => Some((min, max, integer)),
            _ => None,
        }
    }

    fn check(&self, value: &Value) -> Result<(), SchemaError> {
        match &self.kind {
            ParamKind::Number { min, max, integer } => {
                let Some(number) = value.as_f64() else {
                    return Err(self.type_mismatch("a number", value));
                };
                if *integer && number.fract() != 0.0 {
                    return Err(self.type_mismatch("an integer", value));
                }
                if number < *min || number > *max {
                    return Err(SchemaError::OutOfBounds {
                        param: self.name.to_string(),
                        value: number,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(())
            }
            ParamKind::Enum { values } => {
                let Some(text) = enum_text(value) else {
                    return Err(self.type_mismatch("a string or number", value));
                };
                if values.iter().any(|allowed| *allowed == text) {
                    Ok(())
                } else {
                    Err(SchemaError::NotInEnum {
                        param: self.name.to_string(),
                        value: text,
                        allowed: values.join(", "),
                    })
                }
            }
            ParamKind::Color => {
                let Some(text) = value.as_str() else {
                    return Err(self.type_mismatch("a color string", value));
                };
                check_color(self.name, text)
            }
            ParamKind::ColorList { min_len, max_len } => {
                let Some(items) = value.as_array() else {
                    return Err(self.type_mismatch("a list of color strings", value));
                };
                if items.len() < *min_len || items.len() > *max_len {
                    return Err(SchemaError::InvalidLength {
                        param: self.name.to_string(),
                        len: items.len(),
                        min: *min_len,
                        max: *max_len,
                    });
                }
                for (idx, item) in items.iter().enumerate() {
                    let label = format!("{}[{idx}]", self.name);
                    let Some(text) = item.as_str() else {
                        return Err(SchemaError::TypeMismatch {
                            param: label,
                            expected: String::from("a color string"),
                            found: value_type_name(item).to_string(),
                        });
                    };
                    check_color(label.as_str(), text)?;
                }
                Ok(())
            }
        }
    }

    fn type_mismatch(&self, expected: &str, value: &Value) -> SchemaError {
        SchemaError::TypeMismatch {
            param: self.name.to_string(),
            expected: expected.to_string(),
            found: value_type_name(value).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaCheck {
    pub errors: Vec<SchemaError>,
    pub warnings: Vec<String>,
}

impl SchemaCheck {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ToolSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Checks presence, type, bounds and enum membership of every parameter.
    pub fn check(&self, params: &Map<String, Value>) -> SchemaCheck {
        let mut out = SchemaCheck::default();
        for spec in &self.params {
            match params.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        out.errors.push(SchemaError::MissingParameter {
                            param: spec.name.to_string(),
                        });
                    }
                }
                Some(value) => {
                    if let Err(err) = spec.check(value) {
                        out.errors.push(err);
                    }
                }
            }
        }
        for name in params.keys() {
            if self.param(name).is_none() {
                out.warnings
                    .push(format!("unknown parameter '{name}' will be ignored"));
            }
        }
        out
    }

    /// Numeric value of `name`, falling back to the declared default.
    pub fn number_or_default(&self, params: &Map<String, Value>, name: &str) -> Option<f64> {
        number_param(params, name).or_else(|| self.param(name).and_then(|p| p.default))
    }

    pub fn clamp_number(&self, name: &str, value: f64) -> f64 {
        match self.param(name).and_then(ParamSpec::bounds) {
            Some((min, max, integer)) => {
                let clamped = value.clamp(min, max);
                if integer {
                    clamped.round()
                } else {
                    clamped
                }
            }
            None => value,
        }
    }
}

pub fn number_param(params: &Map<String, Value>, name: &str) -> Option<f64> {
    params.get(name).and_then(Value::as_f64)
}

pub fn color_param(params: &Map<String, Value>, name: &str) -> Option<Rgb> {
    params.get(name).and_then(Value::as_str).and_then(Rgb::from_hex)
}

pub fn color_list_param(params: &Map<String, Value>, name: &str) -> Vec<Rgb> {
    params
        .get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(Rgb::from_hex)
                .collect()
        })
        .unwrap_or_default()
}

pub fn enum_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(match number.as_i64() {
            Some(int) => int.to_string(),
            None => number.to_string(),
        }),
        _ => None,
    }
}

/// JSON number for a schema value, integral when the value has no fraction.
pub fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn check_color(param: &str, text: &str) -> Result<(), SchemaError> {
    if Rgb::from_hex(text).is_some() {
        Ok(())
    } else {
        Err(SchemaError::InvalidColor {
            param: param.to_string(),
            value: text.to_string(),
        })
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
