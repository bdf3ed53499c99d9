//! Mutable evaluation state driven by one optimizer at a time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use hf_types::{EvaluationError, Evaluation, ParameterSpace, Position};

use crate::memory::Memory;
use crate::objective::Objective;

/// One visited position, in visit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub position: Position,
    pub evaluation: Evaluation,
    /// Served from memory instead of calling the objective.
    pub cached: bool,
}

/// The current/best state of a single search run.
///
/// A candidate is handed from optimizer to optimizer by the scheduler; it is
/// never driven by two optimizers at once. The memory it consults is shared
/// and may outlive it.
pub struct Candidate {
    space: Arc<ParameterSpace>,
    objective: Arc<dyn Objective>,
    memory: Arc<dyn Memory>,
    current: Option<(Position, f64)>,
    best: Option<(Position, Evaluation)>,
    trace: Vec<TraceEntry>,
    objective_calls: usize,
    memory_hits: usize,
}

impl Candidate {
    pub fn new(
        space: Arc<ParameterSpace>,
        objective: Arc<dyn Objective>,
        memory: Arc<dyn Memory>,
    ) -> Self {
        Self {
            space,
            objective,
            memory,
            current: None,
            best: None,
            trace: Vec::new(),
            objective_calls: 0,
            memory_hits: 0,
        }
    }

    /// Score `position`, consulting memory first.
    ///
    /// A memory hit never calls the objective. A miss calls it once, records
    /// the result in memory and returns the score. The best state is only
    /// replaced by a strictly greater score.
    pub fn evaluate(&mut self, position: Position) -> Result<f64, EvaluationError> {
        if let Some(evaluation) = self.memory.lookup(&position) {
            self.memory_hits += 1;
            let score = evaluation.score;
            self.observe(position, evaluation, true);
            return Ok(score);
        }

        let params = self
            .space
            .materialize(&position)
            .map_err(|e| EvaluationError::Failed {
                position: position.clone(),
                message: e.to_string(),
            })?;

        self.objective_calls += 1;
        let evaluation = self
            .objective
            .evaluate(&params)
            .map_err(|e| EvaluationError::Failed {
                position: position.clone(),
                message: format!("{e:#}"),
            })?;

        if evaluation.score.is_nan() {
            return Err(EvaluationError::NanScore { position });
        }

        self.memory.record(position.clone(), evaluation.clone());
        let score = evaluation.score;
        self.observe(position, evaluation, false);
        Ok(score)
    }

    fn observe(&mut self, position: Position, evaluation: Evaluation, cached: bool) {
        let improves = self
            .best
            .as_ref()
            .map_or(true, |(_, best)| evaluation.score > best.score);
        if improves {
            self.best = Some((position.clone(), evaluation.clone()));
        }
        self.current = Some((position.clone(), evaluation.score));
        self.trace.push(TraceEntry {
            position,
            evaluation,
            cached,
        });
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn current_position(&self) -> Option<&Position> {
        self.current.as_ref().map(|(p, _)| p)
    }

    pub fn current_score(&self) -> Option<f64> {
        self.current.as_ref().map(|(_, s)| *s)
    }

    pub fn best_position(&self) -> Option<&Position> {
        self.best.as_ref().map(|(p, _)| p)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|(_, e)| e.score)
    }

    pub fn best_evaluation(&self) -> Option<&Evaluation> {
        self.best.as_ref().map(|(_, e)| e)
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Number of positions evaluated so far, cached or not.
    pub fn iterations(&self) -> usize {
        self.trace.len()
    }

    pub fn objective_calls(&self) -> usize {
        self.objective_calls
    }

    pub fn memory_hits(&self) -> usize {
        self.memory_hits
    }

    pub fn into_trace(self) -> Vec<TraceEntry> {
        self.trace
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("current", &self.current)
            .field("best", &self.best)
            .field("iterations", &self.trace.len())
            .field("objective_calls", &self.objective_calls)
            .field("memory_hits", &self.memory_hits)
            .finish()
    }
}
