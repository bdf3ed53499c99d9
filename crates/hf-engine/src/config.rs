//! Run configuration.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

use hf_optimizer::{BackendKind, Concurrency};
use hf_types::{ConfigError, HfResult};

pub const BACKEND_ENV: &str = "HYPERFLOW_BACKEND";
pub const N_PROCESSES_ENV: &str = "HYPERFLOW_N_PROCESSES";

/// How search processes are spread over workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub backend: BackendKind,
    /// `-1` for all available parallelism, `0` for sequential, otherwise
    /// the maximum number of concurrently running processes.
    pub n_processes: i64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Pool,
            n_processes: -1,
        }
    }
}

impl DistributionConfig {
    pub fn sequential() -> Self {
        Self {
            backend: BackendKind::Sequential,
            n_processes: 0,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_n_processes(mut self, n_processes: i64) -> Self {
        self.n_processes = n_processes;
        self
    }

    pub fn concurrency(&self) -> Result<Concurrency, ConfigError> {
        Concurrency::from_n_processes(self.n_processes)
    }

    /// Defaults overridden by `HYPERFLOW_BACKEND` and `HYPERFLOW_N_PROCESSES`.
    pub fn from_env() -> HfResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HfResult<Self> {
        let mut config = Self::default();
        if let Some(backend) = lookup(BACKEND_ENV) {
            config.backend = backend.parse()?;
        }
        if let Some(raw) = lookup(N_PROCESSES_ENV) {
            config.n_processes = raw.trim().parse().map_err(|_| {
                ConfigError::Other(format!("{N_PROCESSES_ENV} is not an integer: '{raw}'"))
            })?;
        }
        config.concurrency()?;
        Ok(config)
    }
}

/// Which memory a registration's replicas evaluate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Fresh memory per replica.
    #[default]
    Short,
    /// One long-lived memory shared by all replicas of the registration.
    Long,
}

/// Scalar settings of one registered search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub n_iter: usize,
    /// Replica count; `-1` means one per available core.
    pub n_jobs: i64,
    pub random_seed: Option<u64>,
    pub timeout_secs: Option<f64>,
    pub memory: MemoryKind,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_iter: 10,
            n_jobs: 1,
            random_seed: None,
            timeout_secs: None,
            memory: MemoryKind::Short,
        }
    }
}

impl SearchConfig {
    pub fn replicas(&self) -> Result<usize, ConfigError> {
        resolve_replicas(self.n_jobs)
    }

    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match self.timeout_secs {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| ConfigError::Other(format!("invalid timeout of {secs} seconds"))),
        }
    }
}

/// Number of replicas for an `n_jobs` setting.
pub fn resolve_replicas(n_jobs: i64) -> Result<usize, ConfigError> {
    match n_jobs {
        -1 => Ok(std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)),
        n if n > 0 => Ok(n as usize),
        _ => Err(ConfigError::InvalidReplicas { value: n_jobs }),
    }
}
