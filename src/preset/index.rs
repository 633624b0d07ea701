//! In-memory vector index with cosine similarity search.
//!
//! Holds only vectors keyed by preset query id; the text lives in the record store.

use std::cmp::Ordering;
use std::collections::HashMap;

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// Insertion sequence of the owning record, used to break score ties
    pub seq: u64,
    /// The embedding vector
    pub embedding: Vec<f32>,
    norm: f32,
}

#[cfg(test)]
impl VectorEntry {
    pub fn norm(&self) -> f32 {
        self.norm
    }
}

/// In-memory vector index for preset query retrieval.
///
/// Stores embeddings keyed by preset query id, supporting:
/// - Insert/replace/remove operations
/// - Top-k cosine similarity search with deterministic tie-breaking
pub struct VectorIndex {
    entries: HashMap<String, VectorEntry>,
    dimensions: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub seq: u64,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    #[cfg(test)]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that an embedding can be stored: right dimensions, finite
    /// components and norm, non-zero norm.
    pub fn validate(&self, embedding: &[f32]) -> Result<(), IndexError> {
        self.check_query(embedding)?;

        let norm = Self::l2_norm(embedding);
        if !norm.is_finite() {
            return Err(IndexError::NonFiniteValue);
        }
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        Ok(())
    }

    fn check_query(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteValue);
        }

        Ok(())
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(
        &mut self,
        id: &str,
        seq: u64,
        embedding: Vec<f32>,
    ) -> Result<Option<VectorEntry>, IndexError> {
        self.validate(&embedding)?;

        let norm = Self::l2_norm(&embedding);
        Ok(self.entries.insert(
            id.to_string(),
            VectorEntry {
                seq,
                embedding,
                norm,
            },
        ))
    }

    /// Put back an entry previously taken out of this index.
    pub fn restore(&mut self, id: &str, entry: VectorEntry) {
        self.entries.insert(id.to_string(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<VectorEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Top-`limit` entries by cosine similarity to `query`.
    ///
    /// Results are sorted by score descending; equal scores keep insertion
    /// order (lower `seq` first). A zero-norm query scores every entry 0.0.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        self.check_query(query)?;

        let query_norm = Self::l2_norm(query);
        if !query_norm.is_finite() {
            return Err(IndexError::NonFiniteValue);
        }

        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .map(|(id, entry)| SearchResult {
                id: id.clone(),
                seq: entry.seq,
                score: Self::cosine_similarity(query, query_norm, entry),
            })
            .collect();

        results.sort_by(Self::rank);
        results.truncate(limit);

        Ok(results)
    }

    fn rank(a: &SearchResult, b: &SearchResult) -> Ordering {
        b.score.total_cmp(&a.score).then_with(|| a.seq.cmp(&b.seq))
    }

    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn cosine_similarity(query: &[f32], query_norm: f32, target: &VectorEntry) -> f32 {
        if query_norm < f32::EPSILON || target.norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query
            .iter()
            .zip(target.embedding.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot_product / (query_norm * target.norm)
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store a zero-norm vector")]
    ZeroNormVector,

    #[error("Embedding contains NaN or infinite values")]
    NonFiniteValue,
}
