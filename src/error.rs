//! Error taxonomy for the ingestion pipeline.
//!
//! Most of the crate returns [`anyhow::Result`]. The typed errors here are
//! used where a caller has to branch on the kind of failure: the HTTP layer
//! maps [`PipelineError::Validation`] to `400`, and the provider manager
//! only retries [`ProviderError`]s that report themselves as transient.
//! Catalog writes that fail mid-document surface as [`PipelineError::Storage`].

use thiserror::Error;

pub use crate::provider::ProviderError;

/// Pipeline-level failures that callers may want to distinguish.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad path or options. Raised before any work starts; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A catalog read/write failed. The enclosing transaction is rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Some documents in a run failed while their siblings succeeded.
    #[error("{failed} of {total} documents failed")]
    PartialBatchFailure { failed: u64, total: u64 },
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }
}

/// Returns `true` if the error chain contains a [`PipelineError::Validation`].
pub fn is_validation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::Validation(_))
        )
    })
}

pub fn is_storage(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::Storage(_))
        )
    })
}
