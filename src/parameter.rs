//! Instrument parameter tables.
//!
//! Every driver describes itself with a [`ParameterTable`]: a fixed set of
//! named parameters, each with a value kind, access flags, optional bounds and
//! a unit. The table is filled once when the driver is built. After that only
//! the cached values change, mirroring whatever the last get or set saw on the
//! physical instrument.
//!
//! # Example
//!
//! ```rust
//! use stab_daq::parameter::{Access, ParameterSpec, ParameterTable, ParameterValue, ValueKind};
//!
//! let mut table = ParameterTable::new("dac");
//! table
//!     .add(
//!         ParameterSpec::new("ch1", ValueKind::Float)
//!             .with_range(-10.0, 10.0)
//!             .with_unit("V"),
//!     )
//!     .unwrap();
//!
//! let value = table.validate_set("ch1", ParameterValue::Float(2.5)).unwrap();
//! table.store("ch1", value);
//! assert_eq!(table.cached("ch1").and_then(|v| v.as_f64()), Some(2.5));
//! # let _ = Access::GetSet;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AppResult, DaqError};

// =============================================================================
// Values
// =============================================================================

/// The type a parameter's value is cast to after parsing an instrument reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Floating point (most setpoints and readings)
    #[default]
    Float,
    /// Integer (ranges, modes, counts)
    Int,
    /// Boolean (output enable and similar switches)
    Bool,
    /// Free text (identification strings, units)
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Float => write!(f, "float"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Text => write!(f, "text"),
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Text value
    Text(String),
}

impl ParameterValue {
    /// Parse an instrument reply into a value of the requested kind.
    ///
    /// Accepts the usual SCPI spellings: `+1.234E-03` for floats, integral
    /// floats such as `1.000E+00` for ints and `1/0/ON/OFF/TRUE/FALSE` for
    /// booleans.
    pub fn parse(kind: ValueKind, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match kind {
            ValueKind::Float => raw
                .parse::<f64>()
                .map(ParameterValue::Float)
                .map_err(|_| format!("'{raw}' is not a number")),
            ValueKind::Int => {
                if let Ok(value) = raw.parse::<i64>() {
                    return Ok(ParameterValue::Int(value));
                }
                match raw.parse::<f64>() {
                    Ok(value) if value.is_finite() && value.fract() == 0.0 => {
                        Ok(ParameterValue::Int(value as i64))
                    }
                    _ => Err(format!("'{raw}' is not an integer")),
                }
            }
            ValueKind::Bool => match raw.to_ascii_uppercase().as_str() {
                "1" | "ON" | "TRUE" => Ok(ParameterValue::Bool(true)),
                "0" | "OFF" | "FALSE" => Ok(ParameterValue::Bool(false)),
                other => match other.parse::<f64>() {
                    Ok(value) if value == 0.0 || value == 1.0 => {
                        Ok(ParameterValue::Bool(value == 1.0))
                    }
                    _ => Err(format!("'{raw}' is not a boolean")),
                },
            },
            ValueKind::Text => Ok(ParameterValue::Text(raw.trim_matches('"').to_string())),
        }
    }

    /// Convert this value to `kind`, if that can be done without loss.
    pub fn coerce(self, kind: ValueKind) -> Result<Self, String> {
        match (kind, self) {
            (ValueKind::Float, ParameterValue::Float(v)) => Ok(ParameterValue::Float(v)),
            (ValueKind::Float, ParameterValue::Int(v)) => Ok(ParameterValue::Float(v as f64)),
            (ValueKind::Int, ParameterValue::Int(v)) => Ok(ParameterValue::Int(v)),
            (ValueKind::Int, ParameterValue::Float(v)) if v.is_finite() && v.fract() == 0.0 => {
                Ok(ParameterValue::Int(v as i64))
            }
            (ValueKind::Bool, ParameterValue::Bool(v)) => Ok(ParameterValue::Bool(v)),
            (ValueKind::Bool, ParameterValue::Int(v)) if v == 0 || v == 1 => {
                Ok(ParameterValue::Bool(v == 1))
            }
            (ValueKind::Text, value) => Ok(ParameterValue::Text(value.to_string())),
            (kind, ParameterValue::Text(raw)) => Self::parse(kind, &raw),
            (kind, value) => Err(format!("cannot use {value} as {kind}")),
        }
    }

    /// Numeric view of the value, used by sweeps and data files.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ParameterValue::Text(raw) => raw.trim().parse().ok(),
        }
    }

    /// The kind this value currently holds.
    pub fn kind(&self) -> ValueKind {
        match self {
            ParameterValue::Float(_) => ValueKind::Float,
            ParameterValue::Int(_) => ValueKind::Int,
            ParameterValue::Bool(_) => ValueKind::Bool,
            ParameterValue::Text(_) => ValueKind::Text,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", u8::from(*v)),
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

// =============================================================================
// Specs
// =============================================================================

/// Which directions a parameter supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Readable only (measurements, identification)
    Get,
    /// Writable only; reads return the last value written
    Set,
    /// Readable and writable
    #[default]
    GetSet,
}

impl Access {
    /// Whether the instrument can be queried for this parameter.
    pub fn can_get(self) -> bool {
        matches!(self, Access::Get | Access::GetSet)
    }

    /// Whether this parameter accepts writes.
    pub fn can_set(self) -> bool {
        matches!(self, Access::Set | Access::GetSet)
    }
}

/// Parameter constraints for validation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Constraints {
    /// No constraints
    #[default]
    None,
    /// Inclusive numeric range
    Range { min: f64, max: f64 },
    /// Fixed set of allowed text values (compared case-insensitively)
    Choices(Vec<String>),
}

impl Constraints {
    fn check(&self, name: &str, value: &ParameterValue) -> AppResult<()> {
        match self {
            Constraints::None => Ok(()),
            Constraints::Range { min, max } => {
                let numeric = value.as_f64().ok_or_else(|| DaqError::ParameterInvalidValue {
                    name: name.to_string(),
                    reason: format!("{value} is not numeric"),
                })?;
                if numeric < *min || numeric > *max || numeric.is_nan() {
                    return Err(DaqError::ParameterOutOfRange {
                        name: name.to_string(),
                        value: numeric,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(())
            }
            Constraints::Choices(choices) => {
                let text = value.to_string();
                if choices.iter().any(|c| c.eq_ignore_ascii_case(&text)) {
                    Ok(())
                } else {
                    Err(DaqError::ParameterInvalidValue {
                        name: name.to_string(),
                        reason: format!("'{text}' not one of {}", choices.join(", ")),
                    })
                }
            }
        }
    }
}

/// Static description of one instrument parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name, unique within its instrument
    pub name: String,
    /// Value kind replies are cast to
    pub kind: ValueKind,
    /// Supported directions
    pub access: Access,
    /// Serve reads from the cache instead of querying the instrument
    pub soft_get: bool,
    /// Allowed values
    pub constraints: Constraints,
    /// Physical unit, if any
    pub unit: Option<String>,
    /// Human readable description
    pub description: Option<String>,
    /// Largest change allowed in one write; larger moves are ramped
    pub max_step: Option<f64>,
}

impl ParameterSpec {
    /// Create a get/set parameter with no constraints.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            access: Access::GetSet,
            soft_get: false,
            constraints: Constraints::None,
            unit: None,
            description: None,
            max_step: None,
        }
    }

    /// Set supported directions.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Mark as read-only.
    pub fn read_only(self) -> Self {
        self.with_access(Access::Get)
    }

    /// Serve reads from the cache.
    pub fn soft_get(mut self) -> Self {
        self.soft_get = true;
        self
    }

    /// Restrict to an inclusive numeric range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.constraints = Constraints::Range { min, max };
        self
    }

    /// Restrict to a set of text values.
    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.constraints = Constraints::Choices(choices);
        self
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Limit the size of a single write.
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = Some(max_step);
        self
    }
}

// =============================================================================
// Table
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    spec: ParameterSpec,
    value: Option<ParameterValue>,
}

/// Per-instrument table of parameter specs and their cached values.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    instrument: String,
    entries: BTreeMap<String, Entry>,
}

impl ParameterTable {
    /// Create an empty table for the named instrument.
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Register a parameter. Names must be unique.
    pub fn add(&mut self, spec: ParameterSpec) -> AppResult<&mut Self> {
        if self.entries.contains_key(&spec.name) {
            return Err(DaqError::Configuration(format!(
                "Instrument '{}' declares parameter '{}' twice",
                self.instrument, spec.name
            )));
        }
        self.entries
            .insert(spec.name.clone(), Entry { spec, value: None });
        Ok(self)
    }

    /// Register a parameter together with its initial cached value.
    pub fn add_with_value(
        &mut self,
        spec: ParameterSpec,
        value: ParameterValue,
    ) -> AppResult<&mut Self> {
        let name = spec.name.clone();
        let value = value
            .coerce(spec.kind)
            .map_err(|reason| DaqError::ParameterInvalidValue {
                name: name.clone(),
                reason,
            })?;
        self.add(spec)?;
        self.store(&name, value);
        Ok(self)
    }

    /// Name of the owning instrument.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Look up a spec.
    pub fn spec(&self, name: &str) -> AppResult<&ParameterSpec> {
        self.entries
            .get(name)
            .map(|entry| &entry.spec)
            .ok_or_else(|| DaqError::UnknownParameter {
                instrument: self.instrument.clone(),
                parameter: name.to_string(),
            })
    }

    /// All specs, sorted by name.
    pub fn specs(&self) -> Vec<ParameterSpec> {
        self.entries.values().map(|e| e.spec.clone()).collect()
    }

    /// Check a write against access flags and constraints, returning the value
    /// coerced to the parameter's kind.
    pub fn validate_set(&self, name: &str, value: ParameterValue) -> AppResult<ParameterValue> {
        let spec = self.spec(name)?;
        if !spec.access.can_set() {
            return Err(DaqError::ParameterReadOnly(name.to_string()));
        }
        let value = value
            .coerce(spec.kind)
            .map_err(|reason| DaqError::ParameterInvalidValue {
                name: name.to_string(),
                reason,
            })?;
        spec.constraints.check(name, &value)?;
        Ok(value)
    }

    /// Last known value.
    pub fn cached(&self, name: &str) -> Option<ParameterValue> {
        self.entries.get(name).and_then(|e| e.value.clone())
    }

    /// Update the cache. Unknown names are ignored.
    pub fn store(&mut self, name: &str, value: ParameterValue) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.value = Some(value);
        }
    }

    /// Every cached value, sorted by parameter name.
    pub fn snapshot(&self) -> BTreeMap<String, ParameterValue> {
        self.entries
            .iter()
            .filter_map(|(name, e)| e.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ParameterTable {
        let mut table = ParameterTable::new("dac");
        table
            .add(ParameterSpec::new("ch1", ValueKind::Float).with_range(-10.0, 10.0))
            .unwrap()
            .add(ParameterSpec::new("idn", ValueKind::Text).read_only())
            .unwrap()
            .add(
                ParameterSpec::new("mode", ValueKind::Text)
                    .with_choices(vec!["VOLT".into(), "CURR".into()]),
            )
            .unwrap()
            .add(ParameterSpec::new("range", ValueKind::Int))
            .unwrap();
        table
    }

    #[test]
    fn test_parse_scpi_numbers() {
        assert_eq!(
            ParameterValue::parse(ValueKind::Float, "+1.234E-03").unwrap(),
            ParameterValue::Float(0.001234)
        );
        assert_eq!(
            ParameterValue::parse(ValueKind::Int, " 1.000E+01\n").unwrap(),
            ParameterValue::Int(10)
        );
        assert!(ParameterValue::parse(ValueKind::Int, "1.5").is_err());
        assert!(ParameterValue::parse(ValueKind::Float, "OVLD").is_err());
    }

    #[test]
    fn test_parse_bool_spellings() {
        for raw in ["1", "ON", "on", "TRUE", "+1.0E+00"] {
            assert_eq!(
                ParameterValue::parse(ValueKind::Bool, raw).unwrap(),
                ParameterValue::Bool(true),
                "{raw}"
            );
        }
        for raw in ["0", "OFF", "false"] {
            assert_eq!(
                ParameterValue::parse(ValueKind::Bool, raw).unwrap(),
                ParameterValue::Bool(false)
            );
        }
        assert!(ParameterValue::parse(ValueKind::Bool, "2").is_err());
    }

    #[test]
    fn test_parse_text_strips_quotes() {
        assert_eq!(
            ParameterValue::parse(ValueKind::Text, "\"KEITHLEY 2400\"\r\n").unwrap(),
            ParameterValue::Text("KEITHLEY 2400".into())
        );
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            ParameterValue::Int(3).coerce(ValueKind::Float).unwrap(),
            ParameterValue::Float(3.0)
        );
        assert_eq!(
            ParameterValue::Text("ON".into())
                .coerce(ValueKind::Bool)
                .unwrap(),
            ParameterValue::Bool(true)
        );
        assert!(ParameterValue::Float(0.5).coerce(ValueKind::Int).is_err());
        assert_eq!(ParameterValue::Bool(true).to_string(), "1");
    }

    #[test]
    fn test_range_is_inclusive() {
        let table = table();
        assert!(table.validate_set("ch1", 10.0.into()).is_ok());
        assert!(table.validate_set("ch1", (-10.0).into()).is_ok());
        let err = table.validate_set("ch1", 10.5.into()).unwrap_err();
        assert!(matches!(err, DaqError::ParameterOutOfRange { .. }));
    }

    #[test]
    fn test_read_only_rejects_set() {
        let table = table();
        let err = table.validate_set("idn", "x".into()).unwrap_err();
        assert!(matches!(err, DaqError::ParameterReadOnly(_)));
    }

    #[test]
    fn test_choices() {
        let table = table();
        assert!(table.validate_set("mode", "volt".into()).is_ok());
        assert!(table.validate_set("mode", "RES".into()).is_err());
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let mut table = table();
        assert!(matches!(
            table.spec("ch9"),
            Err(DaqError::UnknownParameter { .. })
        ));
        assert!(table
            .add(ParameterSpec::new("ch1", ValueKind::Float))
            .is_err());
    }

    #[test]
    fn test_cache_and_snapshot() {
        let mut table = table();
        assert!(table.cached("ch1").is_none());
        let value = table.validate_set("range", 2.0.into()).unwrap();
        assert_eq!(value, ParameterValue::Int(2));
        table.store("range", value);
        table.store("nope", ParameterValue::Int(1));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["range"], ParameterValue::Int(2));
    }
}
