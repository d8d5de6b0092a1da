//! In-memory vector index with cosine similarity search.
//!
//! Vectors are stored L2-normalized, so cosine similarity reduces to the
//! inner product. Dimensionality is fixed by the first inserted vector.

use std::collections::BTreeMap;

/// In-memory vector index keyed by requirement id.
///
/// Entries live in a BTreeMap so iteration is ascending by id and search
/// results with equal scores have a stable order.
pub struct VectorIndex {
    entries: BTreeMap<u64, Vec<f32>>,
    /// Fixed by the first inserted vector; retained even when the index
    /// empties out again.
    dimensions: Option<usize>,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Requirement id
    pub id: u64,
    /// Cosine similarity, rounded to 4 decimal places
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

impl VectorIndex {
    /// Create a new empty index; dimensionality will be fixed by the
    /// first insert.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            dimensions: None,
        }
    }

    /// Create an empty index with known dimensionality (used when loading
    /// a file that recorded dimensions but holds no entries).
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            dimensions: Some(dimensions),
        }
    }

    /// Dimensionality, `None` until the first vector is inserted.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterate over entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Vec<f32>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Insert or overwrite an entry, normalizing the vector first.
    ///
    /// The first insert fixes the index dimensionality; later vectors of a
    /// different length are rejected and leave the index untouched.
    pub fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<(), IndexError> {
        if let Some(expected) = self.dimensions {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        let normalized = normalize(vector)?;

        self.dimensions.get_or_insert(normalized.len());
        self.entries.insert(id, normalized);

        Ok(())
    }

    /// Remove an entry, returning the stored (normalized) vector if present.
    pub fn remove(&mut self, id: u64) -> Option<Vec<f32>> {
        self.entries.remove(&id)
    }

    /// Search by cosine similarity.
    ///
    /// Scores are rounded to 4 decimal places; only hits strictly greater
    /// than `threshold` are kept, sorted descending (ties keep ascending-id
    /// order) and truncated to `top_k`.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if self.entries.is_empty() {
            return Ok(vec![]);
        }

        let expected = self.dimensions.unwrap_or(query.len());
        if query.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: query.len(),
            });
        }

        let query = normalize(query.to_vec())?;

        let mut results: Vec<SearchHit> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                let score = round_score(dot(&query, entry));
                if score > threshold {
                    Some(SearchHit { id: *id, score })
                } else {
                    None
                }
            })
            .collect();

        // stable sort: equal scores stay in ascending-id iteration order
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        results.truncate(top_k);

        Ok(results)
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn normalize(mut v: Vec<f32>) -> Result<Vec<f32>, IndexError> {
    let norm = l2_norm(&v);
    if norm < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }

    for x in v.iter_mut() {
        *x /= norm;
    }

    Ok(v)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn round_score(score: f32) -> f32 {
    (score * 10_000.0).round() / 10_000.0
}
