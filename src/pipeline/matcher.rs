//! Similarity matcher: ranks requirements close to a piece of content or
//! to another requirement, hydrating index hits into full records.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::EmbeddingClient;
use crate::requirements::{RequirementQuery, RequirementStore};
use crate::vector::VectorStore;

use super::errors::PipelineError;

/// A matched requirement with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarRequirement {
    pub id: u64,
    pub requirement_title: String,
    pub requirement_content: String,
    pub module: String,
    pub similarity_score: f32,
}

#[derive(Clone)]
pub struct VectorMatcher {
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<VectorStore>,
    requirements: Arc<dyn RequirementStore>,
}

impl VectorMatcher {
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

    /// Find requirements similar to arbitrary content. Results keep the
    /// index's descending-score order; index hits whose requirement row is
    /// gone are dropped.
    pub fn find_similar_by_content(
        &self,
        content: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SimilarRequirement>, PipelineError> {
        let query = self.embedder.embed(content)?;
        let hits = self.vectors.search(&query, threshold, top_k)?;
        if hits.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
        let rows = self.requirements.search(RequirementQuery {
            ids: Some(ids),
            ..Default::default()
        })?;
        let by_id: HashMap<u64, _> = rows.into_iter().map(|r| (r.id, r)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match by_id.get(&hit.id) {
                Some(row) => results.push(SimilarRequirement {
                    id: row.id,
                    requirement_title: row.requirement_title.clone(),
                    requirement_content: row.requirement_content.clone(),
                    module: row.module.clone(),
                    similarity_score: hit.score,
                }),
                // vector outlived its row (deleted requirement)
                None => log::debug!("dropping index hit {} with no live requirement", hit.id),
            }
        }

        Ok(results)
    }

    /// Find requirements similar to an existing one, excluding itself.
    /// A missing or deleted requirement yields an empty result.
    pub fn find_similar_by_requirement_id(
        &self,
        id: u64,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SimilarRequirement>, PipelineError> {
        let row = match self.requirements.get(id)? {
            Some(row) => row,
            None => return Ok(vec![]),
        };

        // fetch one extra so the self-match does not eat a result slot
        let mut similar =
            self.find_similar_by_content(&row.requirement_content, threshold, top_k + 1)?;
        similar.retain(|s| s.id != id);
        similar.truncate(top_k);

        Ok(similar)
    }
}
