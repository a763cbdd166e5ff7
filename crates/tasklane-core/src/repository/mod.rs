//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (tasklane-infra) implements. Every operation runs inside a caller-supplied
//! transaction handle so one engine operation commits or rolls back as a
//! whole. The core crate never depends on any specific storage technology.

pub mod event;
pub mod lock;
pub mod matching;
pub mod payload;
pub mod task;
pub mod workflow;

use tasklane_types::error::RepositoryError;

pub use event::TaskEventRepository;
pub use lock::AdvisoryLocks;
pub use matching::MatchRepository;
pub use payload::PayloadStore;
pub use task::TaskRepository;
pub use workflow::WorkflowRepository;

/// Transaction boundary shared by every repository.
///
/// Dropping a `Tx` without committing rolls it back.
pub trait Transactional: Send + Sync {
    type Tx: Send;

    /// Open a write transaction.
    fn begin(
        &self,
    ) -> impl std::future::Future<Output = Result<Self::Tx, RepositoryError>> + Send;

    /// Commit a transaction, releasing any advisory locks it holds.
    fn commit(
        &self,
        tx: Self::Tx,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Roll back a transaction explicitly.
    fn rollback(
        &self,
        tx: Self::Tx,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Everything the engine needs from storage.
pub trait Gateway:
    TaskRepository + TaskEventRepository + MatchRepository + WorkflowRepository + PayloadStore + AdvisoryLocks
{
}

impl<T> Gateway for T where
    T: TaskRepository
        + TaskEventRepository
        + MatchRepository
        + WorkflowRepository
        + PayloadStore
        + AdvisoryLocks
{
}
