//! The objective function seam.

use std::fmt;
use std::sync::Arc;

use hf_types::{Evaluation, Parameters};

/// An expensive, opaque function scored at one parameter assignment.
///
/// Greater scores are better. Returning `Err` marks the evaluation as failed;
/// the search process owning the call records the failure instead of
/// propagating it to sibling processes.
pub trait Objective: Send + Sync {
    fn evaluate(&self, params: &Parameters) -> anyhow::Result<Evaluation>;
}

impl<O: Objective + ?Sized> Objective for Arc<O> {
    fn evaluate(&self, params: &Parameters) -> anyhow::Result<Evaluation> {
        (**self).evaluate(params)
    }
}

impl<O: Objective + ?Sized> Objective for Box<O> {
    fn evaluate(&self, params: &Parameters) -> anyhow::Result<Evaluation> {
        (**self).evaluate(params)
    }
}

/// Objective backed by a fallible closure.
pub struct FnObjective<F> {
    f: F,
}

impl<F, R> Objective for FnObjective<F>
where
    F: Fn(&Parameters) -> anyhow::Result<R> + Send + Sync,
    R: Into<Evaluation>,
{
    fn evaluate(&self, params: &Parameters) -> anyhow::Result<Evaluation> {
        (self.f)(params).map(Into::into)
    }
}

impl<F> fmt::Debug for FnObjective<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnObjective")
    }
}

/// Objective backed by a closure that always produces a score.
pub struct ScoreFn<F> {
    f: F,
}

impl<F, R> Objective for ScoreFn<F>
where
    F: Fn(&Parameters) -> R + Send + Sync,
    R: Into<Evaluation>,
{
    fn evaluate(&self, params: &Parameters) -> anyhow::Result<Evaluation> {
        Ok((self.f)(params).into())
    }
}

impl<F> fmt::Debug for ScoreFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScoreFn")
    }
}

/// Wrap a fallible closure as an [`Objective`].
pub fn objective_fn<F, R>(f: F) -> FnObjective<F>
where
    F: Fn(&Parameters) -> anyhow::Result<R> + Send + Sync,
    R: Into<Evaluation>,
{
    FnObjective { f }
}

/// Wrap an infallible closure as an [`Objective`].
pub fn score_fn<F, R>(f: F) -> ScoreFn<F>
where
    F: Fn(&Parameters) -> R + Send + Sync,
    R: Into<Evaluation>,
{
    ScoreFn { f }
}
