//! Evaluation memory: a cache from visited positions to measured evaluations.
//!
//! Two lifetimes are offered. [`ShortMemory`] lives and dies with one search
//! process. [`LongMemory`] is created outside the run, may be pre-populated
//! (or loaded from parquet) and can be shared by any number of concurrently
//! running processes.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hf_types::{ConfigError, Evaluation, HfResult, ParameterSpace, Position};

use crate::table::MemoryTable;

/// Position → evaluation lookup used by a candidate before it calls the
/// objective function.
///
/// Implementations only ever hold evaluations the objective actually
/// returned for that position; `record` must not overwrite an existing entry.
pub trait Memory: Send + Sync + fmt::Debug {
    fn lookup(&self, position: &Position) -> Option<Evaluation>;

    fn record(&self, position: Position, evaluation: Evaluation);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct entries in the order they were first recorded.
    fn entries(&self) -> Vec<(Position, Evaluation)>;

    fn stats(&self) -> MemoryStats;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

impl MemoryStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

#[derive(Debug, Default)]
struct OrderedEntries {
    index: HashMap<Position, usize>,
    entries: Vec<(Position, Evaluation)>,
}

/// Ephemeral memory owned by a single search process.
#[derive(Debug, Default)]
pub struct ShortMemory {
    inner: RwLock<OrderedEntries>,
    stats: RwLock<MemoryStats>,
}

impl ShortMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-known entries; later duplicates are ignored.
    pub fn from_entries(entries: impl IntoIterator<Item = (Position, Evaluation)>) -> Self {
        let memory = Self::new();
        for (position, evaluation) in entries {
            memory.insert(position, evaluation);
        }
        memory
    }

    fn insert(&self, position: Position, evaluation: Evaluation) -> bool {
        let mut inner = self.inner.write();
        if inner.index.contains_key(&position) {
            return false;
        }
        let slot = inner.entries.len();
        inner.index.insert(position.clone(), slot);
        inner.entries.push((position, evaluation));
        true
    }

    pub fn to_table(&self, space: &ParameterSpace) -> HfResult<MemoryTable> {
        MemoryTable::from_memory(space, self)
    }
}

impl Memory for ShortMemory {
    fn lookup(&self, position: &Position) -> Option<Evaluation> {
        let found = {
            let inner = self.inner.read();
            inner
                .index
                .get(position)
                .map(|slot| inner.entries[*slot].1.clone())
        };

        let mut stats = self.stats.write();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    fn record(&self, position: Position, evaluation: Evaluation) {
        if self.insert(position, evaluation) {
            self.stats.write().stores += 1;
        }
    }

    fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    fn entries(&self) -> Vec<(Position, Evaluation)> {
        self.inner.read().entries.clone()
    }

    fn stats(&self) -> MemoryStats {
        self.stats.read().clone()
    }
}

/// Long-lived memory that outlives a run and is safe to share between
/// search processes on different threads.
///
/// Positions are grid indices, so a memory only serves the one space it is
/// bound to. The binding is set on first use or by construction.
#[derive(Debug, Default)]
pub struct LongMemory {
    entries: DashMap<Position, (u64, Evaluation)>,
    sequence: AtomicU64,
    space: RwLock<Option<ParameterSpace>>,
    stats: RwLock<MemoryStats>,
}

impl LongMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory bound to `space` from the start.
    pub fn for_space(space: &ParameterSpace) -> Self {
        let memory = Self::new();
        *memory.space.write() = Some(space.clone());
        memory
    }

    /// Bind to `space`, or check that the existing binding matches it.
    pub fn bind(&self, space: &ParameterSpace, search: &str) -> Result<(), ConfigError> {
        let mut bound = self.space.write();
        match bound.as_ref() {
            None => {
                *bound = Some(space.clone());
                Ok(())
            }
            Some(existing) if existing == space => Ok(()),
            Some(_) => Err(ConfigError::MemorySpaceMismatch {
                search: search.to_string(),
            }),
        }
    }

    pub fn space(&self) -> Option<ParameterSpace> {
        self.space.read().clone()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Position, Evaluation)>) -> Self {
        let memory = Self::new();
        for (position, evaluation) in entries {
            memory.insert(position, evaluation);
        }
        memory
    }

    /// Pre-populate from a memory table built against `space`.
    pub fn from_table(space: &ParameterSpace, table: &MemoryTable) -> HfResult<Self> {
        let memory = Self::from_entries(table.to_entries(space)?);
        *memory.space.write() = Some(space.clone());
        Ok(memory)
    }

    pub fn load_parquet<P: AsRef<Path>>(path: P, space: &ParameterSpace) -> HfResult<Self> {
        let table = MemoryTable::read_parquet(path.as_ref())?;
        let memory = Self::from_table(space, &table)?;
        tracing::info!(
            path = %path.as_ref().display(),
            entries = memory.len(),
            "loaded long-term memory"
        );
        Ok(memory)
    }

    pub fn save_parquet<P: AsRef<Path>>(&self, path: P, space: &ParameterSpace) -> HfResult<()> {
        let table = MemoryTable::from_memory(space, self)?;
        table.write_parquet(path.as_ref())?;
        tracing::info!(
            path = %path.as_ref().display(),
            entries = table.num_rows(),
            "saved long-term memory"
        );
        Ok(())
    }

    pub fn to_table(&self, space: &ParameterSpace) -> HfResult<MemoryTable> {
        MemoryTable::from_memory(space, self)
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.stats.write() = MemoryStats::default();
    }

    fn insert(&self, position: Position, evaluation: Evaluation) -> bool {
        let mut inserted = false;
        self.entries.entry(position).or_insert_with(|| {
            inserted = true;
            (self.sequence.fetch_add(1, Ordering::Relaxed), evaluation)
        });
        inserted
    }
}

impl Memory for LongMemory {
    fn lookup(&self, position: &Position) -> Option<Evaluation> {
        let found = self.entries.get(position).map(|entry| entry.value().1.clone());

        let mut stats = self.stats.write();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    fn record(&self, position: Position, evaluation: Evaluation) {
        if self.insert(position, evaluation) {
            self.stats.write().stores += 1;
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Vec<(Position, Evaluation)> {
        let mut ordered: Vec<(u64, Position, Evaluation)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().0, entry.key().clone(), entry.value().1.clone()))
            .collect();
        ordered.sort_by_key(|(sequence, _, _)| *sequence);
        ordered
            .into_iter()
            .map(|(_, position, evaluation)| (position, evaluation))
            .collect()
    }

    fn stats(&self) -> MemoryStats {
        self.stats.read().clone()
    }
}
