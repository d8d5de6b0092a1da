//! Requirement semantic similarity subsystem.
//!
//! Embeds audited requirement text into a persistent vector index,
//! matches similar requirements by cosine similarity, records the matches
//! as bidirectional relations, and drives the audit state machine through
//! a durable retrying task queue.

pub mod config;
pub mod eid;
pub mod embedding;
pub mod lock;
pub mod pipeline;
pub mod relations;
pub mod requirements;
pub mod storage;
pub mod vector;

pub use config::Config;
pub use embedding::{EmbeddingClient, EmbeddingError, FastembedClient};
pub use pipeline::{AuditPipeline, PipelineError, SimilarRequirement, SubmitOutcome};
pub use requirements::{AuditStatus, CoverageStatus, Requirement, RequirementStore};
pub use relations::{MatchMethod, RelationStore, RequirementRelation};
pub use vector::VectorStore;

#[cfg(test)]
mod tests;
