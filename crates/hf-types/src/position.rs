use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the discretized parameter grid: one value index per dimension.
///
/// Positions are the memory cache key, so equality and hashing only look at
/// the indices and never at any score.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<usize>);

impl Position {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, dimension: usize) -> Option<usize> {
        self.0.get(dimension).copied()
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }
}

impl From<Vec<usize>> for Position {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equal_indices_hash_to_one_key() {
        let mut seen = HashSet::new();
        seen.insert(Position::new(vec![1, 2]));
        seen.insert(Position::from(vec![1, 2]));
        seen.insert(Position::new(vec![2, 1]));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn serializes_as_plain_index_list() {
        let json = serde_json::to_string(&Position::new(vec![0, 4])).unwrap();
        assert_eq!(json, "[0,4]");
    }
}
