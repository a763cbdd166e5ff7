//! Named lock leases held across transactions.
//!
//! A lease keeps a tenant-scoped lock (the replay lock, a run lock, a
//! controller's sweep slot) for a holder until it expires or is released.
//! Operations that try the same lock inside their transaction back off while
//! the lease is live.

use std::time::Duration;

use tasklane_types::task::TenantId;

use super::{EngineError, TaskEngine};
use crate::hash::advisory_lock_key;
use crate::repository::Gateway;

impl<G: Gateway> TaskEngine<G> {
    /// Take or renew `holder`'s lease on the lock `name`. Returns false while
    /// someone else holds it.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn acquire_lease(
        &self,
        tenant: TenantId,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let key = advisory_lock_key(tenant, name);
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut ctx = self.begin(tenant).await?;
        let acquired = self
            .gateway
            .acquire_lock_lease(&mut ctx.tx, key, holder, ttl_secs)
            .await?;
        self.gateway.commit(ctx.tx).await?;
        if !acquired {
            tracing::debug!(lock = name, "lease held by another holder");
        }
        Ok(acquired)
    }

    /// Release `holder`'s lease on `name`. Returns false if it held none.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn release_lease(
        &self,
        tenant: TenantId,
        name: &str,
        holder: &str,
    ) -> Result<bool, EngineError> {
        let key = advisory_lock_key(tenant, name);
        let mut ctx = self.begin(tenant).await?;
        let released = self
            .gateway
            .release_lock_lease(&mut ctx.tx, key, holder)
            .await?;
        self.gateway.commit(ctx.tx).await?;
        Ok(released)
    }
}
