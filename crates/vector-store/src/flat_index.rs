use crate::embeddings::cosine_similarity;
use crate::error::{Result, VectorStoreError};
use std::collections::HashMap;

/// Brute-force cosine index keyed by record slot.
pub struct FlatIndex {
    dimension: Option<usize>,
    vectors: HashMap<usize, Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: Option<usize>) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    pub const fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Fails when `vector` does not match the index dimension. The first vector added to an
    /// index without a fixed dimension sets it.
    pub fn check(&self, vector: &[f32]) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != vector.len() => Err(VectorStoreError::InvalidDimension {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    pub fn add(&mut self, slot: usize, vector: Vec<f32>) -> Result<()> {
        self.check(&vector)?;
        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
        }
        self.vectors.insert(slot, vector);
        Ok(())
    }

    pub fn remove(&mut self, slot: usize) -> Option<Vec<f32>> {
        self.vectors.remove(&slot)
    }

    pub fn get(&self, slot: usize) -> Option<&[f32]> {
        self.vectors.get(&slot).map(Vec::as_slice)
    }

    /// Returns (slot, score) sorted by score descending, ties broken by slot.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.check(query)?;

        let mut scores: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .map(|(slot, vector)| (*slot, cosine_similarity(query, vector)))
            .collect();
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scores.truncate(k);
        Ok(scores)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}
