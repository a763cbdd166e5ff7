//! Tenant limiter port.
//!
//! The engine checks a batch against the limiter before commit and records
//! the usage after commit. The sliding-window implementation lives outside
//! this crate; `UnmeteredLimiter` admits everything.

use tasklane_types::task::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeteredResource {
    TaskRun,
    Event,
}

impl std::fmt::Display for MeteredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MeteredResource::TaskRun => "task_run",
            MeteredResource::Event => "event",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("tenant {tenant} exceeded its {resource} limit")]
pub struct LimitExceeded {
    pub tenant: TenantId,
    pub resource: MeteredResource,
}

pub trait TenantLimiter: Send + Sync {
    /// Would `amount` more units fit in the tenant's budget?
    fn check(
        &self,
        tenant: TenantId,
        resource: MeteredResource,
        amount: usize,
    ) -> Result<(), LimitExceeded>;

    /// Record committed usage.
    fn record(&self, tenant: TenantId, resource: MeteredResource, amount: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnmeteredLimiter;

impl TenantLimiter for UnmeteredLimiter {
    fn check(
        &self,
        _tenant: TenantId,
        _resource: MeteredResource,
        _amount: usize,
    ) -> Result<(), LimitExceeded> {
        Ok(())
    }

    fn record(&self, _tenant: TenantId, _resource: MeteredResource, _amount: usize) {}
}
