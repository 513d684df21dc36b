use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Type-safe parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    Color(String),
}

impl ParamValue {
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<&str> {
        match self {
            ParamValue::Color(v) => Some(v),
            _ => None,
        }
    }
}

/// Describes the type and constraints of a parameter, used both for
/// validation and to drive UI generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum ParamType {
    Float {
        min: f64,
        max: f64,
        /// Values are rounded to this many decimal places before storage.
        decimal_places: Option<u32>,
    },
    Int {
        min: i64,
        max: i64,
    },
    Bool,
    Text {
        max_length: Option<usize>,
    },
    Choice {
        choices: Vec<String>,
    },
    Color,
}

impl ParamType {
    /// Check `value` against this type and return the normalized value that
    /// would be stored. Integers are accepted for float parameters.
    pub fn validate(&self, value: &ParamValue) -> Result<ParamValue, String> {
        match (self, value) {
            (
                ParamType::Float {
                    min,
                    max,
                    decimal_places,
                },
                ParamValue::Float(_) | ParamValue::Int(_),
            ) => {
                let v = value.as_float().unwrap_or(f64::NAN);
                if !v.is_finite() {
                    return Err("Value must be finite".to_string());
                }
                if v < *min || v > *max {
                    return Err(format!("Value {v} outside of range [{min}, {max}]"));
                }
                Ok(ParamValue::Float(round_to(v, *decimal_places)))
            }
            (ParamType::Int { min, max }, ParamValue::Int(v)) => {
                if v < min || v > max {
                    return Err(format!("Value {v} outside of range [{min}, {max}]"));
                }
                Ok(value.clone())
            }
            (ParamType::Bool, ParamValue::Bool(_)) => Ok(value.clone()),
            (ParamType::Text { max_length }, ParamValue::Text(s)) => match max_length {
                Some(limit) if s.chars().count() > *limit => {
                    Err(format!("Text longer than {limit} characters"))
                }
                _ => Ok(value.clone()),
            },
            (ParamType::Choice { choices }, ParamValue::Text(s)) => {
                if choices.iter().any(|c| c == s) {
                    Ok(value.clone())
                } else {
                    Err(format!("\"{s}\" is not one of the available choices"))
                }
            }
            (ParamType::Color, ParamValue::Color(s)) => {
                if is_color_literal(s) {
                    Ok(ParamValue::Color(s.to_ascii_lowercase()))
                } else {
                    Err(format!("\"{s}\" is not a color"))
                }
            }
            (ty, v) => Err(format!("Value {v:?} does not match parameter type {ty:?}")),
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn round_to(v: f64, decimal_places: Option<u32>) -> f64 {
    match decimal_places {
        Some(places) => {
            let factor = 10f64.powi(places.min(15) as i32);
            (v * factor).round() / factor
        }
        None => v,
    }
}

/// Accepts `#RRGGBB`, `#RRGGBBAA`, `0xRRGGBB` and `0xRRGGBBAA`.
fn is_color_literal(s: &str) -> bool {
    let digits = s
        .strip_prefix('#')
        .or_else(|| s.strip_prefix("0x"))
        .or_else(|| s.strip_prefix("0X"));
    match digits {
        Some(d) => (d.len() == 6 || d.len() == 8) && d.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Immutable definition of a parameter, as delivered by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ParameterDefinition {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub order: Option<i32>,
    pub param_type: ParamType,
    pub default: ParamValue,
    /// Free-form UI settings passed through untouched.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

impl ParameterDefinition {
    pub fn new(id: &str, name: &str, param_type: ParamType, default: ParamValue) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            display_name: None,
            group: None,
            order: None,
            param_type,
            default,
            settings: None,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }
}

/// Mutable state of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ParameterState {
    pub ui_value: ParamValue,
    pub exec_value: ParamValue,
    pub dirty: bool,
    pub executing: bool,
}

impl ParameterState {
    pub fn new(value: ParamValue) -> Self {
        Self {
            ui_value: value.clone(),
            exec_value: value,
            dirty: false,
            executing: false,
        }
    }

    pub(crate) fn set_ui(&mut self, value: ParamValue) {
        self.ui_value = value;
        self.dirty = self.ui_value != self.exec_value;
    }

    pub(crate) fn set_ui_and_exec(&mut self, value: ParamValue) {
        self.ui_value = value.clone();
        self.exec_value = value;
        self.dirty = false;
    }

    /// Advance the executed value to a value that was sent for execution.
    /// The parameter stays dirty if the UI value moved on in the meantime.
    pub(crate) fn mark_executed(&mut self, value: ParamValue) {
        self.exec_value = value;
        self.dirty = self.ui_value != self.exec_value;
    }
}

/// A parameter: definition plus state.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct Parameter {
    pub definition: ParameterDefinition,
    pub state: ParameterState,
}

impl Parameter {
    /// Create a parameter at its default value. A default that fails its own
    /// type check is kept as-is; the session is authoritative for defaults.
    pub fn from_definition(definition: ParameterDefinition) -> Self {
        let value = definition
            .param_type
            .validate(&definition.default)
            .unwrap_or_else(|_| definition.default.clone());
        Self {
            state: ParameterState::new(value),
            definition,
        }
    }

    pub fn is_valid(&self, value: &ParamValue) -> bool {
        self.definition.param_type.validate(value).is_ok()
    }

    /// True if `value` (after normalization) differs from the current UI value.
    /// Invalid values are always different.
    pub fn is_ui_value_different(&self, value: &ParamValue) -> bool {
        match self.definition.param_type.validate(value) {
            Ok(normalized) => normalized != self.state.ui_value,
            Err(_) => true,
        }
    }
}

/// Definition of an export (a file or email the session can produce on request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ExportDefinition {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub order: Option<i32>,
    pub export_type: String,
}

/// Definition of an output (computed data attached to the model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OutputDefinition {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub order: Option<i32>,
}

/// Lookup key used by the accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterKey {
    Id(String),
    Name(String),
    DisplayName(String),
    /// Try id, then name, then display name.
    Any(String),
}

impl ParameterKey {
    pub(crate) fn matches(&self, id: &str, name: &str, display_name: Option<&str>) -> bool {
        match self {
            ParameterKey::Id(k) => k == id,
            ParameterKey::Name(k) => k == name,
            ParameterKey::DisplayName(k) => display_name == Some(k.as_str()),
            ParameterKey::Any(_) => false,
        }
    }

    /// Expand `Any` into the ordered list of concrete keys to try.
    pub(crate) fn candidates(&self) -> Vec<ParameterKey> {
        match self {
            ParameterKey::Any(k) => vec![
                ParameterKey::Id(k.clone()),
                ParameterKey::Name(k.clone()),
                ParameterKey::DisplayName(k.clone()),
            ],
            other => vec![other.clone()],
        }
    }
}

impl From<&str> for ParameterKey {
    fn from(s: &str) -> Self {
        ParameterKey::Any(s.to_string())
    }
}
