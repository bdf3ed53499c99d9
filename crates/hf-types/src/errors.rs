use thiserror::Error;

use crate::position::Position;

/// Main error type for the Hyperflow system
#[derive(Error, Debug)]
pub enum HfError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Objective evaluation error: {0}")]
    ObjectiveEvaluation(#[from] EvaluationError),

    #[error("Backend execution error: {0}")]
    BackendExecution(#[from] BackendError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Setup errors, raised before any work is scheduled
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("parameter space has no parameters")]
    EmptySpace,

    #[error("parameter {name} has no candidate values")]
    EmptyParameter { name: String },

    #[error("parameter {name} is defined more than once")]
    DuplicateParameter { name: String },

    #[error("optimization strategy has no optimizers")]
    NoOptimizers,

    #[error("optimizer {index} has non-positive duration {duration}")]
    NonPositiveDuration { index: usize, duration: f64 },

    #[error("invalid concurrency value {value}: expected -1, 0 or a positive count")]
    InvalidConcurrency { value: i64 },

    #[error("invalid replica count {value}: expected -1 or a positive count")]
    InvalidReplicas { value: i64 },

    #[error("warm start does not fit the parameter space: {message}")]
    InvalidWarmStart { message: String },

    #[error("shared memory is bound to a different parameter space than search {search}")]
    MemorySpaceMismatch { search: String },

    #[error("unknown search id {id}")]
    UnknownSearch { id: usize },

    #[error("{0}")]
    Other(String),
}

/// Failures raised by the objective function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("objective failed at position {position}: {message}")]
    Failed { position: Position, message: String },

    #[error("objective returned NaN at position {position}")]
    NanScore { position: Position },
}

impl EvaluationError {
    pub fn position(&self) -> &Position {
        match self {
            Self::Failed { position, .. } | Self::NanScore { position } => position,
        }
    }
}

/// Failures of the distribution backend itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("job {job} panicked: {message}")]
    JobPanicked { job: usize, message: String },

    #[error("job {job} could not be dispatched: {message}")]
    DispatchFailed { job: usize, message: String },

    #[error("backend returned no result for job {job}")]
    MissingResult { job: usize },

    #[error("backend {backend} failed: {message}")]
    Crashed {
        backend: String,
        job: usize,
        message: String,
    },
}

impl BackendError {
    /// Index of the job slot this failure belongs to.
    pub fn job(&self) -> usize {
        match self {
            Self::JobPanicked { job, .. }
            | Self::DispatchFailed { job, .. }
            | Self::MissingResult { job }
            | Self::Crashed { job, .. } => *job,
        }
    }
}

/// Memory table and persistence errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("column {column} missing from memory table")]
    MissingColumn { column: String },

    #[error("column {column} has unexpected type {found}")]
    ColumnType { column: String, found: String },

    #[error("value {value} in row {row} is not a candidate of parameter {name}")]
    UnknownValue {
        name: String,
        row: usize,
        value: String,
    },

    #[error("null {column} in row {row}")]
    NullCell { column: String, row: usize },

    #[error("position {position} does not fit the parameter space")]
    PositionOutOfSpace { position: Position },
}

/// Result type alias for Hyperflow operations
pub type HfResult<T> = Result<T, HfError>;

/// Helper trait for converting string errors
pub trait IntoHfError {
    fn into_hf_error(self) -> HfError;
}

impl IntoHfError for String {
    fn into_hf_error(self) -> HfError {
        HfError::Internal(self)
    }
}

impl IntoHfError for &str {
    fn into_hf_error(self) -> HfError {
        HfError::Internal(self.to_string())
    }
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HfError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HfError::InvalidConfiguration($crate::ConfigError::Other(format!($($arg)*)))
    };
}
