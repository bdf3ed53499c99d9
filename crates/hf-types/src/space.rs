//! Search space definitions: the discrete grid every search walks over.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::errors::{ConfigError, HfResult, MemoryError};
use crate::position::Position;

/// A concrete candidate value of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
            Self::Float(_) => None,
        }
    }

    /// Numeric view of the value; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Json(serde_json::Value::Bool(value))
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Json(serde_json::Value::String(value))
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// A single parameter dimension and its ordered candidate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    pub values: Vec<ParameterValue>,
}

impl ParameterDef {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, value: &ParameterValue) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}

/// The full search space: an ordered list of parameter definitions.
///
/// Definition order is the dimension order of every [`Position`] built
/// against this space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub parameters: Vec<ParameterDef>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_values<V>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<ParameterValue>,
    {
        self.parameters.push(ParameterDef {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Integer range `[low, high]` inclusive, walked in `step` increments.
    pub fn add_int_range(self, name: impl Into<String>, low: i64, high: i64, step: i64) -> Self {
        let values: Vec<i64> = if step <= 0 || low > high {
            Vec::new()
        } else {
            (low..=high).step_by(step as usize).collect()
        };
        self.add_values(name, values)
    }

    /// `steps` evenly spaced floats covering `[low, high]`.
    pub fn add_float_grid(self, name: impl Into<String>, low: f64, high: f64, steps: usize) -> Self {
        let values: Vec<f64> = match steps {
            0 => Vec::new(),
            1 => vec![low],
            _ => (0..steps)
                .map(|i| {
                    let t = i as f64 / (steps - 1) as f64;
                    low + t * (high - low)
                })
                .collect(),
        };
        self.add_values(name, values)
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add_values(name, values)
    }

    /// Reject spaces that cannot define a grid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameters.is_empty() {
            return Err(ConfigError::EmptySpace);
        }
        let mut names = HashSet::new();
        for param in &self.parameters {
            if param.values.is_empty() {
                return Err(ConfigError::EmptyParameter {
                    name: param.name.clone(),
                });
            }
            if !names.insert(param.name.as_str()) {
                return Err(ConfigError::DuplicateParameter {
                    name: param.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.parameters.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn dim_sizes(&self) -> Vec<usize> {
        self.parameters.iter().map(|p| p.values.len()).collect()
    }

    /// Total number of grid points (`None` on overflow).
    pub fn grid_size(&self) -> Option<usize> {
        self.parameters
            .iter()
            .try_fold(1usize, |total, param| total.checked_mul(param.values.len()))
    }

    pub fn contains(&self, position: &Position) -> bool {
        position.len() == self.parameters.len()
            && position
                .indices()
                .iter()
                .zip(&self.parameters)
                .all(|(index, param)| *index < param.values.len())
    }

    /// Decode a position into its parameter values.
    pub fn materialize(&self, position: &Position) -> HfResult<Parameters> {
        if !self.contains(position) {
            return Err(MemoryError::PositionOutOfSpace {
                position: position.clone(),
            }
            .into());
        }
        let values = position
            .indices()
            .iter()
            .zip(&self.parameters)
            .map(|(index, param)| (param.name.clone(), param.values[*index].clone()))
            .collect();
        Ok(Parameters { values })
    }

    /// Encode parameter values back into a position, if every value is a
    /// candidate of its dimension.
    pub fn position_of(&self, params: &Parameters) -> Option<Position> {
        self.parameters
            .iter()
            .map(|param| params.get(&param.name).and_then(|v| param.index_of(v)))
            .collect::<Option<Vec<_>>>()
            .map(Position::new)
    }

    pub fn random_position<R: Rng>(&self, rng: &mut R) -> Position {
        Position::new(
            self.parameters
                .iter()
                .map(|param| rng.gen_range(0..param.values.len().max(1)))
                .collect(),
        )
    }

    /// Position at the middle of every dimension.
    pub fn center_position(&self) -> Position {
        Position::new(self.parameters.iter().map(|p| p.values.len() / 2).collect())
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// A materialized parameter assignment, in dimension order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: Vec<(String, ParameterValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParameterValue::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> HashMap<String, ParameterValue> {
        self.values.iter().cloned().collect()
    }
}
