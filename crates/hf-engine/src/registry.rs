//! Search registrations and their expansion into per-replica jobs.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hf_optimizer::{
    default_strategy, CompositeStrategy, LongMemory, MemoryHandle, Objective, Optimizer,
    ProcessDescriptor,
};
use hf_types::{ConfigError, ParameterSpace, Parameters, Position};

use crate::config::{MemoryKind, SearchConfig};

/// Index of a registered search, in registration order.
pub type SearchId = usize;

/// One search to run: an objective over a space, with a strategy and a
/// replica count.
#[derive(Clone)]
pub struct SearchRegistration {
    name: String,
    objective: Arc<dyn Objective>,
    space: ParameterSpace,
    strategy: CompositeStrategy,
    config: SearchConfig,
    warm_start: Option<Parameters>,
    memory: Option<Arc<LongMemory>>,
}

impl SearchRegistration {
    pub fn new(
        name: impl Into<String>,
        objective: impl Objective + 'static,
        space: ParameterSpace,
    ) -> Self {
        Self::from_shared(name, Arc::new(objective), space)
    }

    pub fn from_shared(
        name: impl Into<String>,
        objective: Arc<dyn Objective>,
        space: ParameterSpace,
    ) -> Self {
        Self {
            name: name.into(),
            objective,
            space,
            strategy: default_strategy(),
            config: SearchConfig::default(),
            warm_start: None,
            memory: None,
        }
    }

    pub fn with_strategy(mut self, strategy: CompositeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use a single optimizer for the whole budget.
    pub fn with_optimizer(self, optimizer: impl Optimizer + 'static) -> Self {
        self.with_strategy(CompositeStrategy::single(optimizer))
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.config.n_iter = n_iter;
        self
    }

    pub fn with_n_jobs(mut self, n_jobs: i64) -> Self {
        self.config.n_jobs = n_jobs;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = Some(seed);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_warm_start(mut self, params: Parameters) -> Self {
        self.warm_start = Some(params);
        self
    }

    /// Evaluate against `memory`, shared with anything else holding it.
    /// Registering fails if the memory already serves a different space.
    pub fn with_memory(mut self, memory: Arc<LongMemory>) -> Self {
        self.memory = Some(memory);
        self.config.memory = MemoryKind::Long;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Check everything that can be checked before any work is scheduled.
    pub(crate) fn resolve(self) -> Result<ResolvedSearch, ConfigError> {
        self.space.validate()?;
        self.strategy.validate()?;
        let replicas = self.config.replicas()?;
        let timeout = self.config.timeout()?;

        let warm_start = match &self.warm_start {
            None => None,
            Some(params) => Some(self.space.position_of(params).ok_or_else(|| {
                ConfigError::InvalidWarmStart {
                    message: format!("{params:?} is not a point of the grid"),
                }
            })?),
        };

        let memory = match (&self.memory, self.config.memory) {
            (Some(memory), _) => {
                memory.bind(&self.space, &self.name)?;
                MemoryHandle::Shared(memory.clone())
            }
            (None, MemoryKind::Long) => {
                MemoryHandle::Shared(Arc::new(LongMemory::for_space(&self.space)))
            }
            (None, MemoryKind::Short) => MemoryHandle::Short,
        };

        let base_seed = self
            .config
            .random_seed
            .unwrap_or_else(|| rand::thread_rng().gen::<u32>() as u64);

        Ok(ResolvedSearch {
            name: self.name,
            objective: self.objective,
            space: Arc::new(self.space),
            strategy: self.strategy,
            n_iter: self.config.n_iter,
            replicas,
            base_seed,
            warm_start,
            timeout,
            memory,
        })
    }
}

impl fmt::Debug for SearchRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchRegistration")
            .field("name", &self.name)
            .field("space", &self.space)
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .field("warm_start", &self.warm_start)
            .finish()
    }
}

/// A validated registration, ready to expand into jobs.
#[derive(Clone)]
pub(crate) struct ResolvedSearch {
    pub name: String,
    pub objective: Arc<dyn Objective>,
    pub space: Arc<ParameterSpace>,
    pub strategy: CompositeStrategy,
    pub n_iter: usize,
    pub replicas: usize,
    pub base_seed: u64,
    pub warm_start: Option<Position>,
    pub timeout: Option<Duration>,
    pub memory: MemoryHandle,
}

impl fmt::Debug for ResolvedSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSearch")
            .field("name", &self.name)
            .field("replicas", &self.replicas)
            .field("n_iter", &self.n_iter)
            .field("base_seed", &self.base_seed)
            .field("memory", &self.memory)
            .finish()
    }
}

impl ResolvedSearch {
    /// One descriptor per replica; replica `r` is seeded with `base + r`.
    /// Job indices are assigned later by the distributor.
    pub fn expand(&self, search_id: SearchId) -> Vec<ProcessDescriptor> {
        (0..self.replicas)
            .map(|replica| ProcessDescriptor {
                job_index: 0,
                search_id,
                search_name: self.name.clone(),
                replica,
                objective: self.objective.clone(),
                space: self.space.clone(),
                strategy: self.strategy.clone(),
                n_iter: self.n_iter,
                seed: self.base_seed.wrapping_add(replica as u64),
                warm_start: self.warm_start.clone(),
                timeout: self.timeout,
                memory: self.memory.clone(),
            })
            .collect()
    }
}
