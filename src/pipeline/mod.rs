//! Audit vectorization pipeline: matcher, vectorizer, relation builder
//! and the durable task queue tying them together.

pub mod audit;
pub mod errors;
pub mod matcher;
pub mod relation_builder;
pub mod task_runner;
pub mod vectorizer;

pub use audit::{AuditPipeline, PipelineCore, SubmitOutcome};
pub use errors::PipelineError;
pub use matcher::{SimilarRequirement, VectorMatcher};
pub use relation_builder::RelationBuilder;
pub use vectorizer::{BatchOutcome, VectorizeOutcome, VectorizeStatus, Vectorizer};
