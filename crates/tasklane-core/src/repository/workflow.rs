//! Workflow repository trait definition.
//!
//! Workflow versions are immutable once stored; idempotency claims record
//! which run holds a trigger key.

use tasklane_types::error::RepositoryError;
use tasklane_types::idempotency::{IdempotencyClaim, IdempotencyKey};
use tasklane_types::task::TenantId;
use tasklane_types::workflow::WorkflowVersion;
use uuid::Uuid;

use super::Transactional;

pub trait WorkflowRepository: Transactional {
    /// Store a workflow version with its steps. Re-storing an id replaces it.
    fn put_workflow_version(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        version: &WorkflowVersion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch versions by id. Missing versions are omitted.
    fn get_workflow_versions(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowVersion>, RepositoryError>> + Send;

    /// Tenants that have at least one workflow version.
    fn list_tenants(
        &self,
        tx: &mut Self::Tx,
    ) -> impl std::future::Future<Output = Result<Vec<TenantId>, RepositoryError>> + Send;

    fn get_idempotency_claim(
        &self,
        tx: &mut Self::Tx,
        tenant: TenantId,
        key: &IdempotencyKey,
    ) -> impl std::future::Future<Output = Result<Option<IdempotencyClaim>, RepositoryError>> + Send;

    /// Insert or overwrite the claim for `claim.key`.
    fn put_idempotency_claim(
        &self,
        tx: &mut Self::Tx,
        claim: &IdempotencyClaim,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
