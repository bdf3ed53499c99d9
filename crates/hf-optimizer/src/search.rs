//! Optimizers: pluggable position-proposal strategies.
//!
//! The scheduler only ever talks to the [`Optimizer`] trait; every concrete
//! algorithm lives behind it.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::fmt;

use hf_types::{ParameterSpace, Position};

use crate::candidate::Candidate;

/// Common trait for all optimizers.
pub trait Optimizer: Send + fmt::Debug {
    /// Human-readable optimizer name.
    fn name(&self) -> &str;

    /// Called once before the optimizer's first proposal of a stage.
    fn init(&mut self, _space: &ParameterSpace, _warm_start: Option<&Position>) {}

    /// Propose the next position for the candidate to evaluate.
    fn propose_next(&mut self, candidate: &Candidate, rng: &mut ChaCha8Rng) -> Position;

    /// Report the score obtained at the last proposed position.
    fn report(&mut self, _position: &Position, _score: f64) {}

    fn box_clone(&self) -> Box<dyn Optimizer>;
}

impl Clone for Box<dyn Optimizer> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

// ---- Random search ----

/// Independent uniform sampling across the grid.
#[derive(Debug, Clone, Default)]
pub struct RandomSearch;

impl RandomSearch {
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for RandomSearch {
    fn name(&self) -> &str {
        "random"
    }

    fn propose_next(&mut self, candidate: &Candidate, rng: &mut ChaCha8Rng) -> Position {
        candidate.space().random_position(rng)
    }

    fn box_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

// ---- Grid search ----

/// Walks the grid in row-major order, last dimension fastest, wrapping
/// around once every point has been proposed.
#[derive(Debug, Clone, Default)]
pub struct GridSearch {
    cursor: usize,
}

impl GridSearch {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(mut index: usize, sizes: &[usize]) -> Position {
        let mut indices = vec![0; sizes.len()];
        for (dim, size) in sizes.iter().enumerate().rev() {
            indices[dim] = index % size;
            index /= size;
        }
        Position::new(indices)
    }
}

impl Optimizer for GridSearch {
    fn name(&self) -> &str {
        "grid"
    }

    fn init(&mut self, _space: &ParameterSpace, _warm_start: Option<&Position>) {
        self.cursor = 0;
    }

    fn propose_next(&mut self, candidate: &Candidate, rng: &mut ChaCha8Rng) -> Position {
        let space = candidate.space();
        let total = match space.grid_size() {
            Some(total) if total > 0 => total,
            // Grid too large to enumerate.
            _ => return space.random_position(rng),
        };

        let position = Self::decode(self.cursor % total, &space.dim_sizes());
        self.cursor = (self.cursor + 1) % total;
        position
    }

    fn box_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

// ---- Hill climbing ----

/// Local search around the candidate's best position.
///
/// Each round draws `n_neighbours` neighbours of the current best; a
/// neighbour differs from its base by at most `max(1, round(epsilon * size))`
/// indices in every dimension. Neighbours are proposed one per iteration and
/// a new round is drawn once the queue runs dry or a neighbour beats the
/// base.
#[derive(Debug, Clone)]
pub struct HillClimbing {
    pub epsilon: f64,
    pub n_neighbours: usize,
    pending: VecDeque<Position>,
    base_score: Option<f64>,
}

impl HillClimbing {
    pub fn new(epsilon: f64, n_neighbours: usize) -> Self {
        Self {
            epsilon,
            n_neighbours: n_neighbours.max(1),
            pending: VecDeque::new(),
            base_score: None,
        }
    }

    fn neighbour(&self, base: &Position, sizes: &[usize], rng: &mut ChaCha8Rng) -> Position {
        let indices = base
            .indices()
            .iter()
            .zip(sizes)
            .map(|(&index, &size)| {
                let step = ((self.epsilon * size as f64).round() as i64).max(1);
                let delta: i64 = rng.gen_range(-step..=step);
                (index as i64 + delta).clamp(0, size as i64 - 1) as usize
            })
            .collect();
        Position::new(indices)
    }
}

impl Default for HillClimbing {
    fn default() -> Self {
        Self::new(0.03, 3)
    }
}

impl Optimizer for HillClimbing {
    fn name(&self) -> &str {
        "hill_climbing"
    }

    fn init(&mut self, _space: &ParameterSpace, _warm_start: Option<&Position>) {
        self.pending.clear();
        self.base_score = None;
    }

    fn propose_next(&mut self, candidate: &Candidate, rng: &mut ChaCha8Rng) -> Position {
        if let Some(next) = self.pending.pop_front() {
            return next;
        }

        let space = candidate.space();
        let base = match candidate.best_position() {
            Some(best) => best.clone(),
            None => return space.random_position(rng),
        };

        self.base_score = candidate.best_score();
        let sizes = space.dim_sizes();
        for _ in 0..self.n_neighbours {
            let next = self.neighbour(&base, &sizes, rng);
            self.pending.push_back(next);
        }
        self.pending
            .pop_front()
            .unwrap_or_else(|| space.random_position(rng))
    }

    fn report(&mut self, _position: &Position, score: f64) {
        if self.base_score.is_some_and(|base| score > base) {
            self.pending.clear();
        }
    }

    fn box_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}
