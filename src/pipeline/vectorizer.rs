//! Vectorization orchestration: embeds requirement content into the index
//! and maintains the `is_vectorized` cache flag.
//!
//! Index membership is authoritative; the flag is a cache that can lag
//! behind after a crash between index write and flag write, so every path
//! here checks the index first and repairs the flag when it is stale.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingClient;
use crate::requirements::{RequirementQuery, RequirementStore};
use crate::vector::VectorStore;

use super::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorizeStatus {
    Vectorized,
    Skipped,
    Failed,
}

/// Per-requirement result of a vectorization attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizeOutcome {
    pub requirement_id: u64,
    pub status: VectorizeStatus,
    pub message: String,
}

/// Per-id outcomes of a batch run. Skipped counts as success.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<VectorizeOutcome>,
}

impl BatchOutcome {
    /// Ids that ended up vectorized (freshly or already).
    pub fn succeeded(&self) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|o| o.status != VectorizeStatus::Failed)
            .map(|o| o.requirement_id)
            .collect()
    }

    pub fn failed(&self) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|o| o.status == VectorizeStatus::Failed)
            .map(|o| o.requirement_id)
            .collect()
    }
}

#[derive(Clone)]
pub struct Vectorizer {
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<VectorStore>,
    requirements: Arc<dyn RequirementStore>,
}

impl Vectorizer {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        vectors: Arc<VectorStore>,
        requirements: Arc<dyn RequirementStore>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            requirements,
        }
    }

    /// Vectorize a single requirement. Failures resolve into the outcome
    /// instead of an error so batch siblings keep going.
    pub fn vectorize_one(&self, id: u64) -> VectorizeOutcome {
        let row = match self.requirements.get(id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                return VectorizeOutcome {
                    requirement_id: id,
                    status: VectorizeStatus::Failed,
                    message: format!("requirement {id} not found"),
                }
            }
            Err(e) => {
                return VectorizeOutcome {
                    requirement_id: id,
                    status: VectorizeStatus::Failed,
                    message: format!("failed to load requirement {id}: {e}"),
                }
            }
        };

        match self.vectors.contains(id) {
            Ok(true) => {
                if !row.is_vectorized {
                    // flag repair: the index already holds the vector
                    log::warn!("requirement {id} is in the index but unflagged, repairing");
                    if let Err(e) = self.requirements.set_vectorized(id, true) {
                        return VectorizeOutcome {
                            requirement_id: id,
                            status: VectorizeStatus::Failed,
                            message: format!("failed to repair vectorized flag: {e}"),
                        };
                    }
                }
                return VectorizeOutcome {
                    requirement_id: id,
                    status: VectorizeStatus::Skipped,
                    message: "already vectorized".to_string(),
                };
            }
            Ok(false) => {
                if row.is_vectorized {
                    log::warn!("requirement {id} is flagged vectorized but missing from the index, re-embedding");
                }
            }
            Err(e) => {
                return VectorizeOutcome {
                    requirement_id: id,
                    status: VectorizeStatus::Failed,
                    message: format!("failed to check the index: {e}"),
                }
            }
        }

        let vector = match self.embedder.embed(&row.requirement_content) {
            Ok(vector) => vector,
            Err(e) => {
                log::warn!("embedding failed for requirement {id}: {e}");
                return VectorizeOutcome {
                    requirement_id: id,
                    status: VectorizeStatus::Failed,
                    message: format!("embedding failed: {e}"),
                };
            }
        };

        if let Err(e) = self.vectors.add(id, vector) {
            log::warn!("index add failed for requirement {id}: {e}");
            return VectorizeOutcome {
                requirement_id: id,
                status: VectorizeStatus::Failed,
                message: format!("index add failed: {e}"),
            };
        }

        // flag write comes last; a crash here leaves a repairable stale flag
        if let Err(e) = self.requirements.set_vectorized(id, true) {
            return VectorizeOutcome {
                requirement_id: id,
                status: VectorizeStatus::Failed,
                message: format!("failed to set vectorized flag: {e}"),
            };
        }

        VectorizeOutcome {
            requirement_id: id,
            status: VectorizeStatus::Vectorized,
            message: "vectorized".to_string(),
        }
    }

    /// Vectorize each id sequentially; per-id failures do not stop the rest.
    pub fn vectorize_batch(&self, ids: &[u64]) -> BatchOutcome {
        let outcomes = ids.iter().map(|id| self.vectorize_one(*id)).collect();
        BatchOutcome { outcomes }
    }

    /// Re-embed current content and overwrite the stored vector. The old
    /// vector stays in place if embedding or the index write fails.
    pub fn revectorize(&self, id: u64) -> Result<(), PipelineError> {
        let row = self
            .requirements
            .get(id)?
            .ok_or(PipelineError::NotFound(id))?;

        let vector = self.embedder.embed(&row.requirement_content)?;
        self.vectors.add(id, vector)?;

        if !row.is_vectorized {
            self.requirements.set_vectorized(id, true)?;
        }

        Ok(())
    }

    /// Vectorize every live, not-yet-vectorized requirement of a document.
    pub fn vectorize_by_document(&self, document_id: u64) -> Result<BatchOutcome, PipelineError> {
        let rows = self.requirements.search(RequirementQuery {
            document_id: Some(document_id),
            is_vectorized: Some(false),
            ..Default::default()
        })?;

        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
        Ok(self.vectorize_batch(&ids))
    }
}
