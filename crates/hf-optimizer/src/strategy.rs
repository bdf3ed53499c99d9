//! Composite optimization strategy: proportional budget allocation across a
//! chain of optimizers sharing one candidate.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Instant;
use tracing::debug;

use hf_types::{ConfigError, EvaluationError};

use crate::candidate::Candidate;
use crate::search::{HillClimbing, Optimizer};

/// An optimizer with its relative share of the iteration budget.
#[derive(Debug, Clone)]
pub struct OptimizerSetup {
    pub optimizer: Box<dyn Optimizer>,
    pub duration: f64,
}

/// Ordered chain of optimizers run one after another against the same
/// candidate. A single-optimizer strategy is a chain of length one.
#[derive(Debug, Clone, Default)]
pub struct CompositeStrategy {
    setups: Vec<OptimizerSetup>,
    duration_sum: f64,
}

/// Per-run state threaded through the scheduler.
#[derive(Debug)]
pub struct RunContext {
    pub rng: ChaCha8Rng,
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub iterations: usize,
    pub timed_out: bool,
}

impl CompositeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategy made of one optimizer receiving the whole budget.
    pub fn single(optimizer: impl Optimizer + 'static) -> Self {
        Self {
            setups: vec![OptimizerSetup {
                optimizer: Box::new(optimizer),
                duration: 1.0,
            }],
            duration_sum: 1.0,
        }
    }

    /// Append an optimizer with the given duration weight.
    pub fn add_optimizer(
        &mut self,
        optimizer: impl Optimizer + 'static,
        duration: f64,
    ) -> Result<&mut Self, ConfigError> {
        self.add_boxed(Box::new(optimizer), duration)
    }

    pub fn add_boxed(
        &mut self,
        optimizer: Box<dyn Optimizer>,
        duration: f64,
    ) -> Result<&mut Self, ConfigError> {
        if !(duration.is_finite() && duration > 0.0) {
            return Err(ConfigError::NonPositiveDuration {
                index: self.setups.len(),
                duration,
            });
        }
        self.setups.push(OptimizerSetup {
            optimizer,
            duration,
        });
        self.duration_sum += duration;
        Ok(self)
    }

    /// Builder form of [`CompositeStrategy::add_optimizer`].
    pub fn with_optimizer(
        mut self,
        optimizer: impl Optimizer + 'static,
        duration: f64,
    ) -> Result<Self, ConfigError> {
        self.add_optimizer(optimizer, duration)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.setups.is_empty() {
            return Err(ConfigError::NoOptimizers);
        }
        Ok(())
    }

    pub fn setups(&self) -> &[OptimizerSetup] {
        &self.setups
    }

    pub fn duration_sum(&self) -> f64 {
        self.duration_sum
    }

    pub fn len(&self) -> usize {
        self.setups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setups.is_empty()
    }

    /// Split `total` iterations across the chain.
    ///
    /// Every optimizer but the last gets `round(total * duration / sum)`
    /// (half to even), capped by what is still unallocated; the last gets
    /// the remainder. The result always sums to `total`.
    pub fn allocations(&self, total: usize) -> Vec<usize> {
        let last = self.setups.len().saturating_sub(1);
        let mut remaining = total;
        self.setups
            .iter()
            .enumerate()
            .map(|(index, setup)| {
                let share = if index == last {
                    remaining
                } else {
                    let exact = total as f64 * setup.duration / self.duration_sum;
                    (exact.round_ties_even() as usize).min(remaining)
                };
                remaining -= share;
                share
            })
            .collect()
    }

    /// Drive the chain for `total` iterations against `candidate`.
    ///
    /// Each stage starts from the candidate's best position so far. Stages
    /// allocated zero iterations are never touched. The deadline is checked
    /// between iterations only. The first objective failure aborts the run.
    pub fn run(
        &mut self,
        candidate: &mut Candidate,
        total: usize,
        ctx: &mut RunContext,
    ) -> Result<StrategyOutcome, EvaluationError> {
        let allocations = self.allocations(total);
        let mut outcome = StrategyOutcome {
            iterations: 0,
            timed_out: false,
        };

        for (stage, (setup, budget)) in self.setups.iter_mut().zip(allocations).enumerate() {
            if budget == 0 {
                debug!(stage, optimizer = setup.optimizer.name(), "skipping stage with no budget");
                continue;
            }
            debug!(
                stage,
                optimizer = setup.optimizer.name(),
                iterations = budget,
                warm_start = ?candidate.best_position(),
                "starting optimizer stage"
            );

            setup
                .optimizer
                .init(candidate.space(), candidate.best_position());
            for _ in 0..budget {
                if ctx.expired() {
                    outcome.timed_out = true;
                    return Ok(outcome);
                }
                let position = setup.optimizer.propose_next(candidate, &mut ctx.rng);
                let score = candidate.evaluate(position.clone())?;
                setup.optimizer.report(&position, score);
                outcome.iterations += 1;
            }
        }

        Ok(outcome)
    }
}

impl From<Box<dyn Optimizer>> for CompositeStrategy {
    fn from(optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            setups: vec![OptimizerSetup {
                optimizer,
                duration: 1.0,
            }],
            duration_sum: 1.0,
        }
    }
}

/// Hill climbing alone, the default for new registrations.
pub fn default_strategy() -> CompositeStrategy {
    CompositeStrategy::single(HillClimbing::default())
}
