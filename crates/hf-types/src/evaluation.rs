use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the objective function measured at one position.
///
/// `score` drives the search (greater is better); `metrics` are extra named
/// values carried along for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl Evaluation {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

impl From<f64> for Evaluation {
    fn from(score: f64) -> Self {
        Self::new(score)
    }
}
