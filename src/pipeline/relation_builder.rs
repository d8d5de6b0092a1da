//! Turns similarity matches into persisted bidirectional relation rows.

use std::sync::Arc;

use crate::relations::{MatchMethod, RelationCreate, RelationStore, RequirementRelation};

use super::errors::PipelineError;
use super::matcher::VectorMatcher;

#[derive(Clone)]
pub struct RelationBuilder {
    matcher: VectorMatcher,
    relations: Arc<dyn RelationStore>,
}

impl RelationBuilder {
    pub fn new(matcher: VectorMatcher, relations: Arc<dyn RelationStore>) -> Self {
        Self { matcher, relations }
    }

    /// Build `similar requirement` relations for each id. Both directions
    /// are checked independently so a missing half of an existing pair gets
    /// filled in; all staged rows go to the store in one batched write.
    ///
    /// Idempotent for repeated identical input. Not race-free against
    /// concurrent builders: two of them can both pass the existence check
    /// and the store's conflict skip resolves the duplicate.
    pub fn build_similar_relations(
        &self,
        ids: &[u64],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<RequirementRelation>, PipelineError> {
        let mut staged = vec![];

        for id in ids {
            let matches = self
                .matcher
                .find_similar_by_requirement_id(*id, threshold, top_k)?;

            for candidate in matches {
                if !self.relations.exists(*id, candidate.id)? {
                    staged.push(RelationCreate {
                        source_requirement_id: *id,
                        target_requirement_id: candidate.id,
                        similarity_score: candidate.similarity_score,
                        match_method: MatchMethod::Vector,
                    });
                }
                if !self.relations.exists(candidate.id, *id)? {
                    staged.push(RelationCreate {
                        source_requirement_id: candidate.id,
                        target_requirement_id: *id,
                        similarity_score: candidate.similarity_score,
                        match_method: MatchMethod::Vector,
                    });
                }
            }
        }

        if staged.is_empty() {
            return Ok(vec![]);
        }

        let created = self.relations.bulk_create(staged)?;
        log::info!("created {} similar-requirement relations", created.len());

        Ok(created)
    }
}
