//! # hf-optimizer
//!
//! Search scheduling and distributed execution for Hyperflow.
//!
//! Provides the evaluation memory (short- and long-lived), the candidate
//! that consults it, pluggable optimizers, the composite strategy that splits
//! an iteration budget across a chain of optimizers, search processes, and
//! the distributor that fans processes out over a concurrency backend.

mod candidate;
mod distribute;
mod memory;
mod objective;
mod process;
mod search;
mod strategy;
mod table;

pub use candidate::{Candidate, TraceEntry};
pub use distribute::{
    run_guarded, Backend, BackendKind, Concurrency, CustomBackend, CustomExecutor, Distributor,
    JobOutcome, JobRunner, RayonBackend, SequentialBackend, ThreadPoolBackend,
};
pub use memory::{LongMemory, Memory, MemoryStats, ShortMemory};
pub use objective::{objective_fn, score_fn, FnObjective, Objective, ScoreFn};
pub use process::{
    run_search_process, EntryPoint, FailureKind, JobMeta, MemoryHandle, ProcessDescriptor,
    ProcessId, ProcessState, SearchFailure, SearchProcess, SearchResult,
};
pub use search::{GridSearch, HillClimbing, Optimizer, RandomSearch};
pub use strategy::{
    default_strategy, CompositeStrategy, OptimizerSetup, RunContext, StrategyOutcome,
};
pub use table::{MemoryTable, SCORE_COLUMN};
