// Hyperflow search facade

pub mod config;
pub mod registry;
pub mod results;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use hf_optimizer::{Backend, Distributor, MemoryTable, SearchResult};
use hf_types::{ConfigError, Evaluation, HfResult, ParameterSpace, Parameters, Position};

pub use config::{resolve_replicas, DistributionConfig, MemoryKind, SearchConfig};
pub use registry::{SearchId, SearchRegistration};
pub use results::ResultStore;

use registry::ResolvedSearch;

/// Outcome counts of one [`Hyperflow::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Best score over every successful process of the run.
    pub best_score: Option<f64>,
}

/// Registers searches, runs all of their replicas through one distributor
/// and keeps the merged results.
#[derive(Debug)]
pub struct Hyperflow {
    config: DistributionConfig,
    distributor: Distributor,
    searches: Vec<ResolvedSearch>,
    results: ResultStore,
}

impl Hyperflow {
    /// Create a facade using one of the built-in backends.
    pub fn new(config: DistributionConfig) -> HfResult<Self> {
        let backend = config.backend.into_backend();
        Self::with_backend(config, backend)
    }

    /// Create a facade around any backend, including a custom one.
    pub fn with_backend(config: DistributionConfig, backend: Box<dyn Backend>) -> HfResult<Self> {
        let concurrency = config.concurrency()?;
        info!(
            backend = backend.name(),
            n_processes = config.n_processes,
            "initializing Hyperflow"
        );
        Ok(Self {
            config,
            distributor: Distributor::new(backend, concurrency),
            searches: Vec::new(),
            results: ResultStore::new(),
        })
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Validate and register a search; nothing runs until [`Hyperflow::run`].
    pub fn add_search(&mut self, registration: SearchRegistration) -> HfResult<SearchId> {
        let resolved = registration.resolve()?;
        let id = self.searches.len();
        info!(
            search = %resolved.name,
            id,
            replicas = resolved.replicas,
            n_iter = resolved.n_iter,
            optimizers = resolved.strategy.len(),
            "registered search"
        );
        self.searches.push(resolved);
        Ok(id)
    }

    pub fn search_count(&self) -> usize {
        self.searches.len()
    }

    /// Run every replica of every registered search as one batch.
    ///
    /// Only configuration problems fail the call. Objective and backend
    /// failures are recorded per process and the remaining results are kept.
    pub fn run(&mut self) -> HfResult<RunSummary> {
        if self.searches.is_empty() {
            return Err(ConfigError::Other("no searches registered".to_string()).into());
        }

        let jobs: Vec<_> = self
            .searches
            .iter()
            .enumerate()
            .flat_map(|(id, search)| search.expand(id))
            .collect();
        info!(
            searches = self.searches.len(),
            jobs = jobs.len(),
            backend = self.distributor.backend_name(),
            "starting run"
        );

        let batch = self.distributor.run(jobs);
        let summary = summarize(&batch);
        if summary.failed > 0 {
            warn!(failed = summary.failed, jobs = summary.jobs, "run finished with failures");
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            best_score = ?summary.best_score,
            "run finished"
        );

        self.results.extend(batch);
        Ok(summary)
    }

    fn search(&self, id: SearchId) -> HfResult<&ResolvedSearch> {
        self.searches
            .get(id)
            .ok_or_else(|| ConfigError::UnknownSearch { id }.into())
    }

    pub fn space(&self, id: SearchId) -> HfResult<&ParameterSpace> {
        Ok(self.search(id)?.space.as_ref())
    }

    /// Results of one registration, replicas in order.
    pub fn results(&self, id: SearchId) -> HfResult<&[SearchResult]> {
        self.search(id)?;
        Ok(self.results.for_search(id))
    }

    /// Every result of every registration, in registration then replica
    /// order.
    pub fn all_results(&self) -> Vec<&SearchResult> {
        self.results.iter().collect()
    }

    /// Processes that did not complete.
    pub fn failures(&self) -> Vec<&SearchResult> {
        self.results.iter().filter(|r| !r.is_success()).collect()
    }

    /// Best successful replica of a registration; ties keep the earliest.
    pub fn best_result(&self, id: SearchId) -> HfResult<Option<&SearchResult>> {
        Ok(best_of(self.results(id)?.iter()))
    }

    pub fn best_parameters(&self, id: SearchId) -> HfResult<Option<&Parameters>> {
        Ok(self
            .best_result(id)?
            .and_then(|result| result.best_parameters.as_ref()))
    }

    pub fn best_score(&self, id: SearchId) -> HfResult<Option<f64>> {
        Ok(self.best_result(id)?.and_then(SearchResult::best_score))
    }

    /// Every distinct position any replica of the registration visited, as a
    /// table.
    pub fn search_data(&self, id: SearchId) -> HfResult<MemoryTable> {
        let search = self.search(id)?;
        let entries: Vec<(Position, Evaluation)> = self
            .results
            .for_search(id)
            .iter()
            .flat_map(|result| result.trace.iter())
            .map(|entry| (entry.position.clone(), entry.evaluation.clone()))
            .collect();
        MemoryTable::from_entries(&search.space, &entries)
    }

    /// Shared space handle of a registration.
    pub fn shared_space(&self, id: SearchId) -> HfResult<Arc<ParameterSpace>> {
        Ok(self.search(id)?.space.clone())
    }
}

fn best_of<'a>(results: impl Iterator<Item = &'a SearchResult>) -> Option<&'a SearchResult> {
    let mut best: Option<(&'a SearchResult, f64)> = None;
    for result in results.filter(|r| r.is_success()) {
        let Some(score) = result.best_score() else {
            continue;
        };
        if best.map_or(true, |(_, incumbent)| score > incumbent) {
            best = Some((result, score));
        }
    }
    best.map(|(result, _)| result)
}

fn summarize(batch: &[SearchResult]) -> RunSummary {
    let completed = batch.iter().filter(|r| r.is_success()).count();
    RunSummary {
        jobs: batch.len(),
        completed,
        failed: batch.len() - completed,
        timed_out: batch.iter().filter(|r| r.timed_out).count(),
        best_score: best_of(batch.iter()).and_then(SearchResult::best_score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hf_optimizer::{
        objective_fn, score_fn, BackendKind, CompositeStrategy, CustomBackend, FailureKind,
        GridSearch, HillClimbing, LongMemory, Memory, ProcessState, RandomSearch,
    };
    use hf_types::HfError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn quadratic_space() -> ParameterSpace {
        ParameterSpace::new().add_int_range("x1", -100, 100, 1)
    }

    fn quadratic(name: &str) -> SearchRegistration {
        SearchRegistration::new(
            name,
            score_fn(|p: &Parameters| {
                let x = p.float("x1").unwrap_or_default();
                -(x * x)
            }),
            quadratic_space(),
        )
    }

    #[test]
    fn quadratic_with_four_replicas() {
        init_tracing();
        let mut hyper = Hyperflow::new(DistributionConfig::default()).unwrap();
        let id = hyper
            .add_search(quadratic("quadratic").with_n_iter(15).with_n_jobs(4))
            .unwrap();

        let summary = hyper.run().unwrap();
        assert_eq!(summary.jobs, 4);
        assert_eq!(summary.failed, 0);

        let results = hyper.results(id).unwrap();
        assert_eq!(results.len(), 4);
        for (replica, result) in results.iter().enumerate() {
            assert_eq!(result.replica, replica);
            assert_eq!(result.iterations, 15);
            assert!(result.best_score().unwrap() <= 0.0);
        }

        let aggregate = hyper.best_score(id).unwrap().unwrap();
        assert!(results
            .iter()
            .all(|r| aggregate >= r.best_score().unwrap()));
        assert_eq!(summary.best_score, Some(aggregate));
        assert!(hyper.best_parameters(id).unwrap().is_some());
    }

    #[test]
    fn failing_search_keeps_other_results() {
        let mut hyper = Hyperflow::new(DistributionConfig::default().with_n_processes(3)).unwrap();
        let good = hyper.add_search(quadratic("good").with_n_jobs(2)).unwrap();
        let bad = hyper
            .add_search(SearchRegistration::new(
                "bad",
                objective_fn(|_: &Parameters| -> anyhow::Result<f64> {
                    anyhow::bail!("objective raised")
                }),
                quadratic_space(),
            ))
            .unwrap();

        let summary = hyper.run().unwrap();
        assert_eq!(summary.jobs, 3);
        assert_eq!(summary.failed, 1);

        assert!(hyper.results(good).unwrap().iter().all(SearchResult::is_success));
        let failed = &hyper.results(bad).unwrap()[0];
        assert_eq!(failed.status, ProcessState::Failed);
        assert_eq!(
            failed.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::ObjectiveEvaluation)
        );
        assert_eq!(hyper.failures().len(), 1);
        assert_eq!(hyper.best_score(bad).unwrap(), None);
        assert!(hyper.best_score(good).unwrap().is_some());
    }

    #[test]
    fn results_merge_in_registration_then_replica_order() {
        let mut hyper = Hyperflow::new(DistributionConfig::default()).unwrap();
        hyper.add_search(quadratic("first").with_n_jobs(2)).unwrap();
        hyper.add_search(quadratic("second").with_n_jobs(3)).unwrap();
        hyper.run().unwrap();

        let order: Vec<_> = hyper
            .all_results()
            .iter()
            .map(|r| (r.search_name.clone(), r.replica))
            .collect();
        assert_eq!(
            order,
            vec![
                ("first".to_string(), 0),
                ("first".to_string(), 1),
                ("second".to_string(), 0),
                ("second".to_string(), 1),
                ("second".to_string(), 2),
            ]
        );
    }

    #[test]
    fn sequential_and_all_core_settings_both_run() {
        for n_processes in [-1, 0] {
            for backend in [BackendKind::Sequential, BackendKind::Pool, BackendKind::Rayon] {
                let config = DistributionConfig::default()
                    .with_backend(backend)
                    .with_n_processes(n_processes);
                let mut hyper = Hyperflow::new(config).unwrap();
                hyper.add_search(quadratic("q").with_n_jobs(2)).unwrap();
                let summary = hyper.run().unwrap();
                assert_eq!(summary.completed, 2, "{backend} with {n_processes}");
            }
        }
    }

    #[test]
    fn custom_backend_seam() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let backend = CustomBackend::new("inline", move |entry, jobs, _hint| {
            counter.fetch_add(1, Ordering::SeqCst);
            jobs.into_iter().map(entry).collect()
        });
        let mut hyper =
            Hyperflow::with_backend(DistributionConfig::default(), Box::new(backend)).unwrap();
        hyper.add_search(quadratic("q").with_n_jobs(3)).unwrap();

        let summary = hyper.run().unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_backend_keeps_siblings_of_a_panicking_search() {
        let backend = CustomBackend::new("inline", |run, jobs, _hint| {
            jobs.into_iter().map(run).collect()
        });
        let mut hyper =
            Hyperflow::with_backend(DistributionConfig::default(), Box::new(backend)).unwrap();
        let ok = hyper.add_search(quadratic("ok").with_n_jobs(2)).unwrap();
        let panics = hyper
            .add_search(SearchRegistration::new(
                "panics",
                score_fn(|_: &Parameters| -> f64 { panic!("objective panicked") }),
                quadratic_space(),
            ))
            .unwrap();

        let summary = hyper.run().unwrap();
        assert_eq!(summary.jobs, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert!(hyper.results(ok).unwrap().iter().all(SearchResult::is_success));

        let failed = &hyper.results(panics).unwrap()[0];
        assert_eq!(failed.status, ProcessState::Failed);
        assert_eq!(
            failed.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::BackendExecution)
        );
    }

    #[test]
    fn configuration_errors_prevent_the_run() {
        assert!(matches!(
            Hyperflow::new(DistributionConfig::default().with_n_processes(-7)),
            Err(HfError::InvalidConfiguration(ConfigError::InvalidConcurrency { value: -7 }))
        ));

        let mut hyper = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        assert!(hyper.run().is_err());

        let bad_strategy = CompositeStrategy::new().with_optimizer(RandomSearch::new(), 0.0);
        assert!(bad_strategy.is_err());

        let empty = SearchRegistration::new(
            "empty",
            score_fn(|_: &Parameters| 0.0),
            ParameterSpace::new(),
        );
        assert!(hyper.add_search(empty).is_err());
        assert_eq!(hyper.search_count(), 0);

        assert!(matches!(
            hyper.results(3),
            Err(HfError::InvalidConfiguration(ConfigError::UnknownSearch { id: 3 }))
        ));
    }

    #[test]
    fn composite_strategy_with_warm_start() {
        let strategy = CompositeStrategy::new()
            .with_optimizer(RandomSearch::new(), 1.0)
            .unwrap()
            .with_optimizer(HillClimbing::new(0.05, 3), 2.0)
            .unwrap();
        let mut hyper = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        let id = hyper
            .add_search(
                quadratic("chained")
                    .with_strategy(strategy)
                    .with_n_iter(30)
                    .with_random_seed(9)
                    .with_warm_start(Parameters::new().with("x1", 0)),
            )
            .unwrap();
        hyper.run().unwrap();

        let result = &hyper.results(id).unwrap()[0];
        assert_eq!(result.iterations, 30);
        assert_eq!(result.trace[0].position, Position::new(vec![100]));
        assert_eq!(hyper.best_score(id).unwrap(), Some(0.0));
        assert_eq!(
            hyper.best_parameters(id).unwrap().and_then(|p| p.int("x1")),
            Some(0)
        );
    }

    #[test]
    fn search_data_collects_distinct_positions() {
        let mut hyper = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        let id = hyper
            .add_search(
                SearchRegistration::new(
                    "grid",
                    score_fn(|p: &Parameters| p.float("x").unwrap_or_default()),
                    ParameterSpace::new().add_int_range("x", 0, 4, 1),
                )
                .with_optimizer(GridSearch::new())
                .with_n_iter(8)
                .with_n_jobs(2),
            )
            .unwrap();
        hyper.run().unwrap();

        let table = hyper.search_data(id).unwrap();
        assert_eq!(table.num_rows(), 5);
        assert_eq!(table.column_names(), vec!["x".to_string(), "score".to_string()]);
    }

    #[test]
    fn long_memory_survives_across_facades() {
        let calls = Arc::new(AtomicUsize::new(0));
        let space = ParameterSpace::new().add_int_range("x", 0, 9, 1);
        let make = |memory: Arc<LongMemory>| {
            let counter = calls.clone();
            SearchRegistration::new(
                "cached",
                score_fn(move |p: &Parameters| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    p.float("x").unwrap_or_default()
                }),
                space.clone(),
            )
            .with_optimizer(GridSearch::new())
            .with_n_iter(10)
            .with_memory(memory)
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.parquet");

        let memory = LongMemory::shared();
        let mut first = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        first.add_search(make(memory.clone())).unwrap();
        first.run().unwrap();
        memory.save_parquet(&path, &space).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let restored = Arc::new(LongMemory::load_parquet(&path, &space).unwrap());
        assert_eq!(restored.len(), 10);
        let mut second = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        let id = second.add_search(make(restored)).unwrap();
        second.run().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        let result = &second.results(id).unwrap()[0];
        assert_eq!(result.memory_hits, 10);
        assert_eq!(result.best_score(), Some(9.0));
    }

    fn grid_search(name: &str, low: i64, memory: Arc<LongMemory>) -> SearchRegistration {
        SearchRegistration::new(
            name,
            score_fn(|p: &Parameters| p.float("x").unwrap_or_default()),
            ParameterSpace::new().add_int_range("x", low, low + 4, 1),
        )
        .with_optimizer(GridSearch::new())
        .with_n_iter(5)
        .with_memory(memory)
    }

    #[test]
    fn shared_memory_across_registrations_of_one_space() {
        let memory = LongMemory::shared();
        let mut hyper = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        hyper.add_search(grid_search("a", 0, memory.clone())).unwrap();
        hyper.run().unwrap();

        let b = hyper.add_search(grid_search("b", 0, memory.clone())).unwrap();
        hyper.run().unwrap();

        let latest = hyper.results(b).unwrap().last().unwrap();
        assert_eq!(latest.objective_calls, 0);
        assert_eq!(latest.memory_hits, 5);
        assert_eq!(latest.best_score(), Some(4.0));
        assert_eq!(memory.len(), 5);
    }

    #[test]
    fn shared_memory_rejects_a_registration_with_another_space() {
        let memory = LongMemory::shared();
        let mut hyper = Hyperflow::new(DistributionConfig::sequential()).unwrap();
        hyper.add_search(grid_search("a", 0, memory.clone())).unwrap();

        let err = hyper
            .add_search(grid_search("b", 100, memory.clone()))
            .unwrap_err();
        assert!(matches!(
            err,
            HfError::InvalidConfiguration(ConfigError::MemorySpaceMismatch { ref search })
                if search == "b"
        ));
        assert_eq!(hyper.search_count(), 1);

        hyper.run().unwrap();
        assert_eq!(hyper.best_score(0).unwrap(), Some(4.0));
    }
}
