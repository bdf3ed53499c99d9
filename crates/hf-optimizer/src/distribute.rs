//! Fan-out of search processes over a concurrency backend and fan-in of
//! their results in submission order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use hf_types::{BackendError, ConfigError};

use crate::process::{run_search_process, EntryPoint, JobMeta, ProcessDescriptor, SearchResult};

/// What a backend hands back for one job.
pub type JobOutcome = Result<SearchResult, BackendError>;

/// Executes a batch of search processes.
///
/// Outcomes may come back in any order; each one identifies its slot through
/// `SearchResult::job_index` or `BackendError::job`.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn execute(
        &self,
        entry: EntryPoint,
        jobs: Vec<ProcessDescriptor>,
        workers: usize,
    ) -> Vec<JobOutcome>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one job, turning a panic into a failure for that slot only.
pub fn run_guarded(entry: EntryPoint, job: ProcessDescriptor) -> JobOutcome {
    let index = job.job_index;
    panic::catch_unwind(AssertUnwindSafe(|| entry(job))).map_err(|payload| {
        BackendError::JobPanicked {
            job: index,
            message: panic_message(payload.as_ref()),
        }
    })
}

// ---- Sequential ----

/// Runs every job inline, in submission order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialBackend;

impl Backend for SequentialBackend {
    fn name(&self) -> &str {
        "sequential"
    }

    fn execute(
        &self,
        entry: EntryPoint,
        jobs: Vec<ProcessDescriptor>,
        _workers: usize,
    ) -> Vec<JobOutcome> {
        jobs.into_iter().map(|job| run_guarded(entry, job)).collect()
    }
}

// ---- Fixed-size worker pool ----

/// Up to `workers` scoped threads pulling jobs from a shared queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPoolBackend;

impl Backend for ThreadPoolBackend {
    fn name(&self) -> &str {
        "pool"
    }

    fn execute(
        &self,
        entry: EntryPoint,
        jobs: Vec<ProcessDescriptor>,
        workers: usize,
    ) -> Vec<JobOutcome> {
        let total = jobs.len();
        let workers = workers.clamp(1, total.max(1));
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<ProcessDescriptor>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<JobOutcome>();

        let mut outcomes = Vec::with_capacity(total);
        for job in jobs {
            if let Err(err) = job_tx.send(job) {
                outcomes.push(Err(BackendError::DispatchFailed {
                    job: err.0.job_index,
                    message: "job queue closed".to_string(),
                }));
            }
        }
        drop(job_tx);

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("hf-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        for job in job_rx.iter() {
                            debug!(worker, job = job.job_index, "worker picked up job");
                            if result_tx.send(run_guarded(entry, job)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!(worker, error = %err, "failed to spawn pool worker");
                }
            }
        });
        drop(result_tx);

        outcomes.extend(result_rx.try_iter());
        // Left over when no worker could be spawned.
        outcomes.extend(job_rx.try_iter().map(|job| {
            Err(BackendError::DispatchFailed {
                job: job.job_index,
                message: "no pool worker available".to_string(),
            })
        }));
        outcomes
    }
}

// ---- Rayon ----

/// Dedicated rayon thread pool sized by the worker count.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonBackend;

impl Backend for RayonBackend {
    fn name(&self) -> &str {
        "rayon"
    }

    fn execute(
        &self,
        entry: EntryPoint,
        jobs: Vec<ProcessDescriptor>,
        workers: usize,
    ) -> Vec<JobOutcome> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("hf-rayon-{i}"))
            .build();

        match pool {
            Ok(pool) => pool.install(|| {
                jobs.into_par_iter()
                    .map(|job| run_guarded(entry, job))
                    .collect()
            }),
            Err(err) => jobs
                .into_iter()
                .map(|job| {
                    Err(BackendError::DispatchFailed {
                        job: job.job_index,
                        message: format!("thread pool error: {err}"),
                    })
                })
                .collect(),
        }
    }
}

// ---- Caller-supplied ----

/// Per-job runner handed to a custom executor. A panic inside one job is
/// caught and turned into a failed result for that job.
pub type JobRunner<'a> = &'a (dyn Fn(ProcessDescriptor) -> SearchResult + Sync);

/// Executor signature for [`CustomBackend`]: job runner, per-job argument
/// records and a concurrency hint in; one result per job out, in input order.
pub type CustomExecutor =
    dyn Fn(JobRunner<'_>, Vec<ProcessDescriptor>, usize) -> Vec<SearchResult> + Send + Sync;

/// Integration seam for an external parallel-execution mechanism. The
/// concurrency value is only a hint here.
#[derive(Clone)]
pub struct CustomBackend {
    name: String,
    executor: Arc<CustomExecutor>,
}

impl CustomBackend {
    pub fn new<F>(name: impl Into<String>, executor: F) -> Self
    where
        F: Fn(JobRunner<'_>, Vec<ProcessDescriptor>, usize) -> Vec<SearchResult>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            executor: Arc::new(executor),
        }
    }
}

impl fmt::Debug for CustomBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomBackend")
            .field("name", &self.name)
            .finish()
    }
}

impl Backend for CustomBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        entry: EntryPoint,
        jobs: Vec<ProcessDescriptor>,
        workers: usize,
    ) -> Vec<JobOutcome> {
        let backend = self.name.as_str();
        let runner = move |job: ProcessDescriptor| {
            let meta = job.meta();
            run_guarded(entry, job).unwrap_or_else(|error| {
                warn!(backend, job = meta.job_index, error = %error, "job failed in custom backend");
                SearchResult::from_backend_failure(&meta, &error)
            })
        };
        (self.executor)(&runner, jobs, workers)
            .into_iter()
            .map(Ok)
            .collect()
    }
}

// ---- Selection ----

/// Built-in backend selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sequential,
    #[default]
    Pool,
    Rayon,
}

impl BackendKind {
    pub fn into_backend(self) -> Box<dyn Backend> {
        match self {
            Self::Sequential => Box::new(SequentialBackend),
            Self::Pool => Box::new(ThreadPoolBackend),
            Self::Rayon => Box::new(RayonBackend),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "pool" | "multiprocessing" => Ok(Self::Pool),
            "rayon" => Ok(Self::Rayon),
            other => Err(ConfigError::Other(format!("unknown backend '{other}'"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::Pool => "pool",
            Self::Rayon => "rayon",
        })
    }
}

/// Normalized concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One job at a time, in submission order.
    Sequential,
    /// As many workers as the machine offers.
    Available,
    Limited(usize),
}

impl Concurrency {
    /// `-1` means all available parallelism, `0` fully sequential, `n > 0`
    /// at most `n` workers. Anything below `-1` is rejected.
    pub fn from_n_processes(value: i64) -> Result<Self, ConfigError> {
        match value {
            -1 => Ok(Self::Available),
            0 => Ok(Self::Sequential),
            n if n > 0 => Ok(Self::Limited(n as usize)),
            _ => Err(ConfigError::InvalidConcurrency { value }),
        }
    }

    /// Worker count for `n_jobs` jobs, never above the job count and never
    /// below one.
    pub fn workers(&self, n_jobs: usize) -> usize {
        let cap = match self {
            Self::Sequential => 1,
            Self::Available => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            Self::Limited(n) => *n,
        };
        cap.min(n_jobs).max(1)
    }
}

// ---- Distributor ----

/// Runs a batch of search processes through one backend and returns their
/// results index-aligned with submission order.
#[derive(Debug)]
pub struct Distributor {
    backend: Box<dyn Backend>,
    concurrency: Concurrency,
    entry: EntryPoint,
}

impl Distributor {
    pub fn new(backend: Box<dyn Backend>, concurrency: Concurrency) -> Self {
        Self {
            backend,
            concurrency,
            entry: run_search_process,
        }
    }

    /// Replace the per-job entry point.
    pub fn with_entry_point(mut self, entry: EntryPoint) -> Self {
        self.entry = entry;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Run `jobs`; slot `i` of the output always belongs to `jobs[i]`.
    ///
    /// Job indices are reassigned to submission order. Every slot is filled:
    /// a job the backend lost or crashed on gets a failed result.
    pub fn run(&self, mut jobs: Vec<ProcessDescriptor>) -> Vec<SearchResult> {
        for (index, job) in jobs.iter_mut().enumerate() {
            job.job_index = index;
        }
        let metas: Vec<JobMeta> = jobs.iter().map(ProcessDescriptor::meta).collect();
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let workers = self.concurrency.workers(total);
        info!(
            backend = self.backend.name(),
            jobs = total,
            workers,
            "distributing search processes"
        );

        let outcomes = panic::catch_unwind(AssertUnwindSafe(|| {
            self.backend.execute(self.entry, jobs, workers)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(backend = self.backend.name(), error = %message, "backend crashed");
            (0..total)
                .map(|job| {
                    Err(BackendError::Crashed {
                        backend: self.backend.name().to_string(),
                        job,
                        message: message.clone(),
                    })
                })
                .collect()
        });

        let mut slots: Vec<Option<SearchResult>> = vec![None; total];
        for outcome in outcomes {
            let (index, result) = match outcome {
                Ok(result) => (result.job_index, result),
                Err(error) => {
                    let index = error.job();
                    let Some(meta) = metas.get(index) else {
                        warn!(job = index, error = %error, "backend reported failure for unknown job");
                        continue;
                    };
                    warn!(
                        search = %meta.search_name,
                        replica = meta.replica,
                        job = index,
                        error = %error,
                        "job failed in backend"
                    );
                    (index, SearchResult::from_backend_failure(meta, &error))
                }
            };

            match slots.get_mut(index) {
                Some(slot @ None) => *slot = Some(result),
                Some(Some(_)) => warn!(job = index, "duplicate result ignored"),
                None => warn!(job = index, "result for unknown job ignored"),
            }
        }

        let results: Vec<SearchResult> = slots
            .into_iter()
            .zip(&metas)
            .map(|(slot, meta)| {
                slot.unwrap_or_else(|| {
                    let error = BackendError::MissingResult {
                        job: meta.job_index,
                    };
                    warn!(job = meta.job_index, error = %error, "job result missing");
                    SearchResult::from_backend_failure(meta, &error)
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            backend = self.backend.name(),
            completed = total - failed,
            failed,
            "search processes finished"
        );
        results
    }
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new(Box::new(ThreadPoolBackend), Concurrency::Available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LongMemory, Memory};
    use crate::objective::{objective_fn, score_fn, Objective};
    use crate::process::{FailureKind, MemoryHandle, ProcessState};
    use crate::search::HillClimbing;
    use crate::strategy::CompositeStrategy;
    use hf_types::{ParameterSpace, Parameters};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn quadratic() -> Arc<dyn Objective> {
        Arc::new(score_fn(|p: &Parameters| {
            let x = p.float("x1").unwrap_or_default();
            -(x * x)
        }))
    }

    fn job(name: &str, objective: Arc<dyn Objective>) -> ProcessDescriptor {
        ProcessDescriptor {
            job_index: 0,
            search_id: 0,
            search_name: name.to_string(),
            replica: 0,
            objective,
            space: Arc::new(ParameterSpace::new().add_int_range("x1", -100, 100, 1)),
            strategy: CompositeStrategy::single(HillClimbing::default()),
            n_iter: 10,
            seed: 3,
            warm_start: None,
            timeout: None,
            memory: MemoryHandle::Short,
        }
    }

    fn names(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.search_name.as_str()).collect()
    }

    static FINISH_ORDER: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

    fn staggered(descriptor: ProcessDescriptor) -> SearchResult {
        let delay = match descriptor.search_name.as_str() {
            "A" => 150,
            "B" => 75,
            _ => 0,
        };
        thread::sleep(Duration::from_millis(delay));
        let result = run_search_process(descriptor);
        FINISH_ORDER.lock().push(result.search_name.clone());
        result
    }

    fn panicking(descriptor: ProcessDescriptor) -> SearchResult {
        if descriptor.search_name == "boom" {
            panic!("worker blew up");
        }
        run_search_process(descriptor)
    }

    #[test]
    fn pool_results_follow_submission_order() {
        let distributor = Distributor::new(Box::new(ThreadPoolBackend), Concurrency::Limited(3))
            .with_entry_point(staggered);
        let jobs = vec![job("A", quadratic()), job("B", quadratic()), job("C", quadratic())];

        let results = distributor.run(jobs);

        assert_eq!(names(&results), vec!["A", "B", "C"]);
        assert_eq!(FINISH_ORDER.lock().first().map(String::as_str), Some("C"));
        for (index, result) in results.iter().enumerate() {
            assert_eq!(result.job_index, index);
            assert!(result.is_success());
        }
    }

    #[test]
    fn failing_job_leaves_siblings_intact() {
        let failing = Arc::new(objective_fn(|_: &Parameters| -> anyhow::Result<f64> {
            anyhow::bail!("first evaluation failed")
        }));
        let jobs = vec![
            job("ok-1", quadratic()),
            job("bad", failing),
            job("ok-2", quadratic()),
        ];

        for backend in [BackendKind::Sequential, BackendKind::Pool, BackendKind::Rayon] {
            let distributor = Distributor::new(backend.into_backend(), Concurrency::Limited(2));
            let results = distributor.run(jobs.clone());

            assert_eq!(results.len(), 3, "{backend}");
            assert!(results[0].is_success());
            assert_eq!(results[1].status, ProcessState::Failed);
            assert_eq!(
                results[1].failure.as_ref().map(|f| f.kind),
                Some(FailureKind::ObjectiveEvaluation)
            );
            assert!(results[2].is_success());
        }
    }

    #[test]
    fn panicking_job_is_recorded_as_backend_failure() {
        let distributor = Distributor::new(Box::new(ThreadPoolBackend), Concurrency::Available)
            .with_entry_point(panicking);
        let jobs = vec![job("fine", quadratic()), job("boom", quadratic())];

        let results = distributor.run(jobs);
        assert!(results[0].is_success());
        let failure = results[1].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::BackendExecution);
        assert!(failure.message.contains("worker blew up"));
    }

    #[test]
    fn custom_backend_output_is_reordered() {
        let reversed = CustomBackend::new("reversed", |entry, jobs, _hint| {
            jobs.into_iter().rev().map(entry).collect()
        });
        let distributor = Distributor::new(Box::new(reversed), Concurrency::Limited(2));
        let jobs = vec![job("A", quadratic()), job("B", quadratic()), job("C", quadratic())];

        let results = distributor.run(jobs);
        assert_eq!(names(&results), vec!["A", "B", "C"]);
        assert_eq!(distributor.backend_name(), "reversed");
    }

    #[test]
    fn custom_backend_contains_a_panicking_job() {
        let inline = CustomBackend::new("inline", |run, jobs, _hint| {
            jobs.into_iter().map(run).collect()
        });
        let distributor =
            Distributor::new(Box::new(inline), Concurrency::Sequential).with_entry_point(panicking);
        let jobs = vec![job("ok-1", quadratic()), job("boom", quadratic()), job("ok-2", quadratic())];

        let results = distributor.run(jobs);
        assert_eq!(names(&results), vec!["ok-1", "boom", "ok-2"]);
        assert!(results[0].is_success());
        assert!(results[2].is_success());
        let failure = results[1].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::BackendExecution);
        assert!(failure.message.contains("worker blew up"));
    }

    #[test]
    fn duplicate_result_keeps_the_first() {
        let echoing = CustomBackend::new("echoing", |run, jobs, _hint| {
            let mut results: Vec<SearchResult> = jobs.into_iter().map(run).collect();
            let mut echo = results[0].clone();
            echo.search_name = "echo".to_string();
            results.push(echo);
            results
        });
        let distributor = Distributor::new(Box::new(echoing), Concurrency::Sequential);
        let results = distributor.run(vec![job("A", quadratic()), job("B", quadratic())]);

        assert_eq!(names(&results), vec!["A", "B"]);
        assert!(results.iter().all(SearchResult::is_success));
    }

    #[test]
    fn dropped_result_becomes_missing_slot() {
        let lossy = CustomBackend::new("lossy", |entry, jobs, _hint| {
            jobs.into_iter().skip(1).map(entry).collect()
        });
        let distributor = Distributor::new(Box::new(lossy), Concurrency::Sequential);
        let results = distributor.run(vec![job("A", quadratic()), job("B", quadratic())]);

        assert_eq!(results[0].status, ProcessState::Failed);
        assert!(results[0]
            .failure
            .as_ref()
            .is_some_and(|f| f.message.contains("no result")));
        assert!(results[1].is_success());
    }

    #[test]
    fn crashing_backend_fails_every_slot() {
        let crashing = CustomBackend::new("crashing", |_entry, _jobs, _hint| {
            panic!("executor died")
        });
        let distributor = Distributor::new(Box::new(crashing), Concurrency::Available);
        let results = distributor.run(vec![job("A", quadratic()), job("B", quadratic())]);

        assert_eq!(names(&results), vec!["A", "B"]);
        assert!(results.iter().all(|r| r.status == ProcessState::Failed));
    }

    #[test]
    fn rayon_backend_shares_long_memory() {
        let memory = LongMemory::shared();
        let jobs: Vec<_> = (0..6)
            .map(|replica| {
                let mut descriptor = job("shared", quadratic());
                descriptor.replica = replica;
                descriptor.seed = replica as u64;
                descriptor.memory = MemoryHandle::Shared(memory.clone());
                descriptor
            })
            .collect();

        let distributor = Distributor::new(Box::new(RayonBackend), Concurrency::Limited(3));
        let results = distributor.run(jobs);

        let replicas: Vec<_> = results.iter().map(|r| r.replica).collect();
        assert_eq!(replicas, vec![0, 1, 2, 3, 4, 5]);
        assert!(results.iter().all(SearchResult::is_success));
        // Two replicas may race on the same miss; only the first record sticks.
        let calls: usize = results.iter().map(|r| r.objective_calls).sum();
        assert!(!memory.is_empty());
        assert!(calls >= memory.len());
    }

    #[test]
    fn concurrency_normalization() {
        assert_eq!(Concurrency::from_n_processes(-1), Ok(Concurrency::Available));
        assert_eq!(Concurrency::from_n_processes(0), Ok(Concurrency::Sequential));
        assert_eq!(Concurrency::from_n_processes(4), Ok(Concurrency::Limited(4)));
        assert_eq!(
            Concurrency::from_n_processes(-3),
            Err(ConfigError::InvalidConcurrency { value: -3 })
        );

        assert_eq!(Concurrency::Sequential.workers(10), 1);
        assert_eq!(Concurrency::Limited(8).workers(3), 3);
        assert_eq!(Concurrency::Limited(2).workers(3), 2);
        assert!(Concurrency::Available.workers(64) >= 1);
        assert_eq!(Concurrency::Available.workers(0), 1);
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("pool".parse::<BackendKind>(), Ok(BackendKind::Pool));
        assert_eq!(" Rayon ".parse::<BackendKind>(), Ok(BackendKind::Rayon));
        assert!("joblib".parse::<BackendKind>().is_err());
        assert_eq!(
            serde_json::to_string(&BackendKind::Sequential).unwrap(),
            "\"sequential\""
        );
    }

    #[test]
    fn empty_batch_returns_nothing() {
        assert!(Distributor::default().run(Vec::new()).is_empty());
    }
}
