use crate::embedding::EmbeddingError;
use crate::vector::VectorStoreError;

/// Aggregate error where the pipeline components meet.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("requirement {0} not found")]
    NotFound(u64),

    #[error(transparent)]
    Provider(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorStoreError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the failed unit of work is worth re-running as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Provider(e) => e.is_retryable(),
            PipelineError::Vector(e) => e.is_retryable(),
            PipelineError::NotFound(_) | PipelineError::Store(_) => false,
        }
    }
}
