//! Search processes: one complete optimization run per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use hf_types::{
    BackendError, Evaluation, EvaluationError, HfResult, ParameterSpace, Parameters, Position,
};

use crate::candidate::{Candidate, TraceEntry};
use crate::memory::{LongMemory, Memory, ShortMemory};
use crate::objective::Objective;
use crate::strategy::{CompositeStrategy, RunContext, StrategyOutcome};
use crate::table::MemoryTable;

/// Unique search process identifier.
pub type ProcessId = Uuid;

/// Entry point every backend invokes once per job.
pub type EntryPoint = fn(ProcessDescriptor) -> SearchResult;

/// Lifecycle state of a search process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Which memory a process evaluates against.
#[derive(Debug, Clone, Default)]
pub enum MemoryHandle {
    /// Fresh memory created for the run and dropped with it.
    #[default]
    Short,
    /// Memory injected from outside; survives the run and may be shared.
    Shared(Arc<LongMemory>),
}

impl MemoryHandle {
    fn instantiate(&self) -> Arc<dyn Memory> {
        match self {
            Self::Short => Arc::new(ShortMemory::new()),
            Self::Shared(memory) => memory.clone(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

/// Identity of a job, kept separately so a result can be synthesized for a
/// slot whose process never reported back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_index: usize,
    pub search_id: usize,
    pub search_name: String,
    pub replica: usize,
    pub seed: u64,
}

/// Everything one search process needs to run.
#[derive(Clone)]
pub struct ProcessDescriptor {
    pub job_index: usize,
    pub search_id: usize,
    pub search_name: String,
    pub replica: usize,
    pub objective: Arc<dyn Objective>,
    pub space: Arc<ParameterSpace>,
    pub strategy: CompositeStrategy,
    pub n_iter: usize,
    pub seed: u64,
    /// Evaluated first; counts as one of `n_iter`.
    pub warm_start: Option<Position>,
    pub timeout: Option<Duration>,
    pub memory: MemoryHandle,
}

impl ProcessDescriptor {
    pub fn meta(&self) -> JobMeta {
        JobMeta {
            job_index: self.job_index,
            search_id: self.search_id,
            search_name: self.search_name.clone(),
            replica: self.replica,
            seed: self.seed,
        }
    }
}

impl fmt::Debug for ProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDescriptor")
            .field("job_index", &self.job_index)
            .field("search_id", &self.search_id)
            .field("search_name", &self.search_name)
            .field("replica", &self.replica)
            .field("strategy", &self.strategy)
            .field("n_iter", &self.n_iter)
            .field("seed", &self.seed)
            .field("warm_start", &self.warm_start)
            .field("timeout", &self.timeout)
            .field("memory", &self.memory)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ObjectiveEvaluation,
    BackendExecution,
}

/// Why a search process did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFailure {
    pub kind: FailureKind,
    /// Position whose evaluation failed, when known.
    pub position: Option<Position>,
    pub message: String,
}

impl From<&EvaluationError> for SearchFailure {
    fn from(error: &EvaluationError) -> Self {
        Self {
            kind: FailureKind::ObjectiveEvaluation,
            position: Some(error.position().clone()),
            message: error.to_string(),
        }
    }
}

impl From<&BackendError> for SearchFailure {
    fn from(error: &BackendError) -> Self {
        Self {
            kind: FailureKind::BackendExecution,
            position: None,
            message: error.to_string(),
        }
    }
}

/// Outcome of one search process. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub process_id: ProcessId,
    pub job_index: usize,
    pub search_id: usize,
    pub search_name: String,
    pub replica: usize,
    pub seed: u64,
    pub status: ProcessState,
    pub best_position: Option<Position>,
    pub best_parameters: Option<Parameters>,
    pub best_evaluation: Option<Evaluation>,
    pub trace: Vec<TraceEntry>,
    pub iterations: usize,
    pub objective_calls: usize,
    pub memory_hits: usize,
    /// Stopped early by the wall-clock budget; results are still valid.
    pub timed_out: bool,
    pub failure: Option<SearchFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SearchResult {
    pub fn best_score(&self) -> Option<f64> {
        self.best_evaluation.as_ref().map(|e| e.score)
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcessState::Completed
    }

    /// Result for a slot the backend could not run to completion.
    pub fn from_backend_failure(meta: &JobMeta, error: &BackendError) -> Self {
        Self {
            process_id: Uuid::new_v4(),
            job_index: meta.job_index,
            search_id: meta.search_id,
            search_name: meta.search_name.clone(),
            replica: meta.replica,
            seed: meta.seed,
            status: ProcessState::Failed,
            best_position: None,
            best_parameters: None,
            best_evaluation: None,
            trace: Vec::new(),
            iterations: 0,
            objective_calls: 0,
            memory_hits: 0,
            timed_out: false,
            failure: Some(error.into()),
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    /// Visited positions as a table, one row per distinct position in visit
    /// order.
    pub fn to_table(&self, space: &ParameterSpace) -> HfResult<MemoryTable> {
        let entries: Vec<(Position, Evaluation)> = self
            .trace
            .iter()
            .map(|entry| (entry.position.clone(), entry.evaluation.clone()))
            .collect();
        MemoryTable::from_entries(space, &entries)
    }
}

/// One optimization run: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug)]
pub struct SearchProcess {
    id: ProcessId,
    descriptor: ProcessDescriptor,
    state: ProcessState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl SearchProcess {
    pub fn new(descriptor: ProcessDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            state: ProcessState::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn mark_running(&mut self) {
        self.state = ProcessState::Running;
        self.started_at = Some(Utc::now());
        info!(
            search = %self.descriptor.search_name,
            replica = self.descriptor.replica,
            job = self.descriptor.job_index,
            seed = self.descriptor.seed,
            n_iter = self.descriptor.n_iter,
            shared_memory = self.descriptor.memory.is_shared(),
            "search process started"
        );
    }

    fn mark_completed(&mut self) {
        self.state = ProcessState::Completed;
        self.finished_at = Some(Utc::now());
    }

    fn mark_failed(&mut self, error: &EvaluationError) {
        self.state = ProcessState::Failed;
        self.finished_at = Some(Utc::now());
        warn!(
            search = %self.descriptor.search_name,
            replica = self.descriptor.replica,
            job = self.descriptor.job_index,
            position = %error.position(),
            error = %error,
            "search process failed"
        );
    }

    /// Run to completion. Objective failures end up in the result rather
    /// than being returned.
    pub fn run(mut self) -> SearchResult {
        self.mark_running();

        let memory = self.descriptor.memory.instantiate();
        let mut candidate = Candidate::new(
            self.descriptor.space.clone(),
            self.descriptor.objective.clone(),
            memory,
        );
        let deadline = self.descriptor.timeout.map(|timeout| Instant::now() + timeout);
        let mut ctx = RunContext::new(self.descriptor.seed).with_deadline(deadline);

        let outcome = self.drive(&mut candidate, &mut ctx);
        let (timed_out, failure) = match &outcome {
            Ok(outcome) => {
                self.mark_completed();
                if outcome.timed_out {
                    warn!(
                        search = %self.descriptor.search_name,
                        replica = self.descriptor.replica,
                        iterations = outcome.iterations,
                        "search process timed out, keeping partial results"
                    );
                }
                (outcome.timed_out, None)
            }
            Err(error) => {
                self.mark_failed(error);
                (false, Some(SearchFailure::from(error)))
            }
        };

        let best_position = candidate.best_position().cloned();
        let best_parameters = best_position
            .as_ref()
            .and_then(|position| self.descriptor.space.materialize(position).ok());
        let result = SearchResult {
            process_id: self.id,
            job_index: self.descriptor.job_index,
            search_id: self.descriptor.search_id,
            search_name: self.descriptor.search_name.clone(),
            replica: self.descriptor.replica,
            seed: self.descriptor.seed,
            status: self.state,
            best_position,
            best_parameters,
            best_evaluation: candidate.best_evaluation().cloned(),
            iterations: candidate.iterations(),
            objective_calls: candidate.objective_calls(),
            memory_hits: candidate.memory_hits(),
            trace: candidate.into_trace(),
            timed_out,
            failure,
            started_at: self.started_at,
            finished_at: self.finished_at,
        };

        if result.is_success() {
            info!(
                search = %result.search_name,
                replica = result.replica,
                best_score = ?result.best_score(),
                iterations = result.iterations,
                objective_calls = result.objective_calls,
                memory_hits = result.memory_hits,
                "search process completed"
            );
        }
        result
    }

    fn drive(
        &mut self,
        candidate: &mut Candidate,
        ctx: &mut RunContext,
    ) -> Result<StrategyOutcome, EvaluationError> {
        let mut budget = self.descriptor.n_iter;
        let mut warm_started = 0;

        if let Some(warm_start) = self.descriptor.warm_start.clone() {
            if budget > 0 {
                candidate.evaluate(warm_start)?;
                budget -= 1;
                warm_started = 1;
            }
        }

        let mut outcome = self.descriptor.strategy.run(candidate, budget, ctx)?;
        outcome.iterations += warm_started;
        Ok(outcome)
    }
}

/// Default entry point handed to backends.
pub fn run_search_process(descriptor: ProcessDescriptor) -> SearchResult {
    SearchProcess::new(descriptor).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::{objective_fn, score_fn};
    use crate::search::{GridSearch, HillClimbing, RandomSearch};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quadratic_space() -> Arc<ParameterSpace> {
        Arc::new(ParameterSpace::new().add_int_range("x1", -100, 100, 1))
    }

    fn descriptor(objective: Arc<dyn Objective>, n_iter: usize) -> ProcessDescriptor {
        ProcessDescriptor {
            job_index: 0,
            search_id: 0,
            search_name: "quadratic".into(),
            replica: 0,
            objective,
            space: quadratic_space(),
            strategy: CompositeStrategy::single(HillClimbing::default()),
            n_iter,
            seed: 7,
            warm_start: None,
            timeout: None,
            memory: MemoryHandle::Short,
        }
    }

    fn quadratic() -> Arc<dyn Objective> {
        Arc::new(score_fn(|p: &Parameters| {
            let x = p.float("x1").unwrap_or_default();
            -(x * x)
        }))
    }

    #[test]
    fn completed_run_reports_best_and_trace() {
        let result = run_search_process(descriptor(quadratic(), 15));

        assert_eq!(result.status, ProcessState::Completed);
        assert!(result.is_success());
        assert_eq!(result.iterations, 15);
        assert_eq!(result.trace.len(), 15);
        assert!(result.best_score().unwrap() <= 0.0);
        assert!(result.started_at.is_some());
        assert!(result.finished_at.is_some());

        let best_in_trace = result
            .trace
            .iter()
            .map(|entry| entry.evaluation.score)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.best_score(), Some(best_in_trace));

        let x = result.best_parameters.as_ref().and_then(|p| p.int("x1"));
        assert_eq!(x.map(|x| -((x * x) as f64)), result.best_score());
    }

    #[test]
    fn warm_start_is_evaluated_first() {
        let mut desc = descriptor(quadratic(), 5);
        desc.warm_start = Some(Position::new(vec![100]));

        let result = run_search_process(desc);
        assert_eq!(result.trace[0].position, Position::new(vec![100]));
        assert_eq!(result.best_score(), Some(0.0));
        assert_eq!(result.iterations, 5);
    }

    #[test]
    fn first_evaluation_failure_fails_the_process() {
        let objective = Arc::new(objective_fn(|_: &Parameters| -> anyhow::Result<f64> {
            anyhow::bail!("cannot fit")
        }));
        let result = run_search_process(descriptor(objective, 10));

        assert_eq!(result.status, ProcessState::Failed);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ObjectiveEvaluation);
        assert!(failure.position.is_some());
        assert!(failure.message.contains("cannot fit"));
        assert!(result.best_position.is_none());
    }

    #[test]
    fn zero_timeout_completes_with_partial_results() {
        let mut desc = descriptor(quadratic(), 50);
        desc.timeout = Some(Duration::ZERO);

        let result = run_search_process(desc);
        assert_eq!(result.status, ProcessState::Completed);
        assert!(result.timed_out);
        assert!(result.iterations < 50);
        assert!(result.failure.is_none());
    }

    #[test]
    fn shared_memory_spans_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let objective: Arc<dyn Objective> = Arc::new(score_fn(move |p: &Parameters| {
            counter.fetch_add(1, Ordering::SeqCst);
            -p.float("x").unwrap_or_default().abs()
        }));
        let space = Arc::new(ParameterSpace::new().add_int_range("x", 0, 4, 1));
        let memory = LongMemory::shared();

        let mut desc = descriptor(objective, 5);
        desc.space = space;
        desc.strategy = CompositeStrategy::single(GridSearch::new());
        desc.memory = MemoryHandle::Shared(memory.clone());

        let first = run_search_process(desc.clone());
        let second = run_search_process(desc);

        assert_eq!(first.objective_calls, 5);
        assert_eq!(second.objective_calls, 0);
        assert_eq!(second.memory_hits, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(memory.len(), 5);
        assert_eq!(first.best_position, second.best_position);
    }

    #[test]
    fn same_seed_reproduces_trace() {
        let mut desc = descriptor(quadratic(), 20);
        desc.strategy = CompositeStrategy::single(RandomSearch::new());

        let a = run_search_process(desc.clone());
        let b = run_search_process(desc);
        let positions = |r: &SearchResult| r.trace.iter().map(|e| e.position.clone()).collect::<Vec<_>>();
        assert_eq!(positions(&a), positions(&b));
    }

    #[test]
    fn result_table_has_one_row_per_distinct_position() {
        let space = Arc::new(ParameterSpace::new().add_int_range("x", 0, 2, 1));
        let mut desc = descriptor(quadratic(), 7);
        desc.space = space.clone();
        desc.strategy = CompositeStrategy::single(GridSearch::new());

        let result = run_search_process(desc);
        let table = result.to_table(&space).unwrap();
        assert_eq!(result.trace.len(), 7);
        assert_eq!(table.num_rows(), 3);
    }
}
