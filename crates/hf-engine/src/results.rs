//! Append-only per-search result store.

use hf_optimizer::SearchResult;

use crate::registry::SearchId;

/// Results grouped by registration, replicas in order. Filled only once a
/// whole distribution batch has resolved.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    by_search: Vec<Vec<SearchResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolved batch. Results are routed by their search id.
    pub fn extend(&mut self, batch: Vec<SearchResult>) {
        for result in batch {
            let id = result.search_id;
            if self.by_search.len() <= id {
                self.by_search.resize_with(id + 1, Vec::new);
            }
            self.by_search[id].push(result);
        }
    }

    pub fn for_search(&self, id: SearchId) -> &[SearchResult] {
        self.by_search.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every result, registration by registration.
    pub fn iter(&self) -> impl Iterator<Item = &SearchResult> {
        self.by_search.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_search.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
