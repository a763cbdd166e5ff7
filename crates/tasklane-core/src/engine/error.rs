//! Engine error type.

use tasklane_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),

    /// Some attempts of a release batch do not exist.
    #[error("released {released} of {expected} tasks")]
    PartialRelease { expected: usize, released: usize },

    #[error("payload error: {0}")]
    Payload(String),

    #[error("unknown step {0}")]
    UnknownStep(Uuid),

    #[error("unknown workflow version {0}")]
    UnknownWorkflowVersion(Uuid),

    #[error("idempotency key '{key}' is claimed by run {claimed_by}")]
    AlreadyClaimed { key: String, claimed_by: Uuid },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
