//! Periodic sweeps: timeouts, lease reassignments, retry queue and durable
//! sleeps for every tenant.
//!
//! Each sweep is bounded by its configured batch size and repeated while the
//! batch came back full. A running controller only sweeps tenants whose
//! sweep lease it holds, so several controllers can share one database.

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tasklane_core::engine::SweepResult;
use tasklane_core::repository::{Transactional, WorkflowRepository};
use tasklane_core::EngineError;
use tasklane_types::task::TenantId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::Engine;

/// Lease name a controller holds per tenant while it sweeps it.
pub const SWEEP_LEASE: &str = "controller-sweep";

/// Leases outlive a few missed ticks before another controller takes over.
const LEASE_TICKS: u32 = 3;

/// Attempts handled by one pass over a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepTotals {
    pub timeouts: usize,
    pub reassignments: usize,
    pub retries: usize,
    pub sleeps: usize,
}

impl SweepTotals {
    pub fn total(&self) -> usize {
        self.timeouts + self.reassignments + self.retries + self.sleeps
    }
}

async fn drain<F, Fut>(mut sweep: F) -> Result<usize, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SweepResult, EngineError>>,
{
    let mut processed = 0;
    loop {
        let result = sweep().await?;
        processed += result.processed;
        if !result.should_continue {
            return Ok(processed);
        }
    }
}

/// Run every sweep for one tenant until each is drained.
pub async fn sweep_tenant(engine: &Engine, tenant: TenantId) -> Result<SweepTotals, EngineError> {
    Ok(SweepTotals {
        timeouts: drain(|| engine.process_task_timeouts(tenant)).await?,
        reassignments: drain(|| engine.process_task_reassignments(tenant)).await?,
        retries: drain(|| engine.process_task_retry_queue_items(tenant)).await?,
        sleeps: drain(|| engine.process_durable_sleeps(tenant)).await?,
    })
}

/// Tenants known to the store.
pub async fn list_tenants(engine: &Engine) -> Result<Vec<TenantId>, EngineError> {
    let gateway = engine.gateway();
    let mut tx = gateway.begin().await?;
    let tenants = gateway.list_tenants(&mut tx).await;
    gateway.rollback(tx).await?;
    Ok(tenants?)
}

/// One pass over `tenants`. A failing tenant is logged and left out.
pub async fn sweep_tenants(engine: &Engine, tenants: &[TenantId]) -> Vec<(TenantId, SweepTotals)> {
    let results = join_all(tenants.iter().map(|tenant| async move {
        (*tenant, sweep_tenant(engine, *tenant).await)
    }))
    .await;

    let mut swept = Vec::with_capacity(results.len());
    for (tenant, result) in results {
        match result {
            Ok(totals) => {
                if totals.total() > 0 {
                    tracing::info!(
                        tenant_id = %tenant,
                        timeouts = totals.timeouts,
                        reassignments = totals.reassignments,
                        retries = totals.retries,
                        sleeps = totals.sleeps,
                        "sweep pass"
                    );
                }
                swept.push((tenant, totals));
            }
            Err(err) => tracing::warn!(tenant_id = %tenant, error = %err, "sweep failed"),
        }
    }
    swept
}

/// One pass over every tenant.
pub async fn sweep_all(engine: &Engine) -> Result<Vec<(TenantId, SweepTotals)>, EngineError> {
    let tenants = list_tenants(engine).await?;
    Ok(sweep_tenants(engine, &tenants).await)
}

/// One pass over the tenants whose sweep lease `holder` holds or can take.
pub async fn sweep_leased(
    engine: &Engine,
    holder: &str,
    lease: Duration,
) -> Result<Vec<(TenantId, SweepTotals)>, EngineError> {
    let mut owned = Vec::new();
    for tenant in list_tenants(engine).await? {
        match engine.acquire_lease(tenant, SWEEP_LEASE, holder, lease).await {
            Ok(true) => owned.push(tenant),
            Ok(false) => tracing::debug!(tenant_id = %tenant, "tenant swept by another controller"),
            Err(err) => tracing::warn!(tenant_id = %tenant, error = %err, "sweep lease failed"),
        }
    }
    Ok(sweep_tenants(engine, &owned).await)
}

async fn release_leases(engine: &Engine, holder: &str) {
    let tenants = match list_tenants(engine).await {
        Ok(tenants) => tenants,
        Err(err) => {
            tracing::warn!(error = %err, "listing tenants failed, leases left to expire");
            return;
        }
    };
    for tenant in tenants {
        if let Err(err) = engine.release_lease(tenant, SWEEP_LEASE, holder).await {
            tracing::warn!(tenant_id = %tenant, error = %err, "releasing sweep lease failed");
        }
    }
}

/// Sweep every `interval` until `cancel` fires.
pub async fn run(engine: &Engine, interval: Duration, cancel: CancellationToken) {
    let interval = interval.max(Duration::from_millis(100));
    let holder = format!("controller-{}", Uuid::now_v7());
    let lease = interval.max(Duration::from_secs(1)) * LEASE_TICKS;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_ms = interval.as_millis() as u64, holder = %holder, "sweeper started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = sweep_leased(engine, &holder, lease).await {
                    tracing::warn!(error = %err, "listing tenants failed");
                }
            }
        }
    }

    release_leases(engine, &holder).await;
    tracing::info!("sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasklane_core::engine::TriggerOpts;
    use tasklane_infra::sqlite::DatabasePool;
    use tasklane_types::config::EngineConfig;
    use tasklane_types::dag::RunStatus;
    use tasklane_types::workflow::{StepDefinition, WorkflowVersion};
    use uuid::Uuid;

    use crate::state::AppState;

    async fn test_state(config: EngineConfig) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let data_dir = dir.path().to_path_buf();
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        AppState::from_pool(pool, config, data_dir)
    }

    async fn single_step_version(engine: &Engine, tenant: TenantId, step: StepDefinition) -> Uuid {
        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "sweep".to_string(),
            steps: vec![step],
        };
        engine.put_workflow_version(tenant, &version).await.unwrap();
        version.id
    }

    #[tokio::test]
    async fn test_empty_store_sweeps_nothing() {
        let state = test_state(EngineConfig::default()).await;
        assert!(sweep_all(&state.engine).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_all_times_out_running_attempts() {
        let state = test_state(EngineConfig::default()).await;
        let engine = &state.engine;
        let tenant = TenantId::new();
        let mut step = StepDefinition::new("slow", "run:slow");
        step.timeout_secs = 0;
        let version_id = single_step_version(engine, tenant, step).await;

        let run = engine
            .trigger_workflow_runs(tenant, vec![TriggerOpts::new(version_id, json!({}))])
            .await
            .unwrap()
            .remove(0);
        let task = &run.tasks[0];
        engine
            .assign_tasks(tenant, Uuid::now_v7(), &[task.attempt()])
            .await
            .unwrap();

        let swept = sweep_all(engine).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, tenant);
        assert_eq!(swept[0].1.timeouts, 1);
        assert_eq!(swept[0].1.total(), 1);

        let finalized = engine
            .list_finalized_workflow_runs(tenant, &[run.external_id])
            .await
            .unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_full_batches_are_drained() {
        let mut config = EngineConfig::default();
        config.sweeps.durable_sleeps = 1;
        let state = test_state(config).await;
        let engine = &state.engine;
        let tenant = TenantId::new();
        let version_id = single_step_version(engine, tenant, StepDefinition::new("a", "run:a")).await;

        let run = engine
            .trigger_workflow_runs(tenant, vec![TriggerOpts::new(version_id, json!({}))])
            .await
            .unwrap()
            .remove(0);
        let task = &run.tasks[0];
        engine.register_durable_sleep(tenant, task.attempt(), 0).await.unwrap();
        engine.register_durable_sleep(tenant, task.attempt(), 0).await.unwrap();

        let totals = sweep_tenant(engine, tenant).await.unwrap();
        assert_eq!(totals.sleeps, 2);
    }

    #[tokio::test]
    async fn test_tenant_is_swept_by_one_lease_holder() {
        let state = test_state(EngineConfig::default()).await;
        let engine = &state.engine;
        let tenant = TenantId::new();
        let mut step = StepDefinition::new("slow", "run:slow");
        step.timeout_secs = 0;
        let version_id = single_step_version(engine, tenant, step).await;
        let run = engine
            .trigger_workflow_runs(tenant, vec![TriggerOpts::new(version_id, json!({}))])
            .await
            .unwrap()
            .remove(0);
        engine
            .assign_tasks(tenant, Uuid::now_v7(), &[run.tasks[0].attempt()])
            .await
            .unwrap();

        let lease = Duration::from_secs(60);
        let first = sweep_leased(engine, "controller-a", lease).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.timeouts, 1);
        assert!(sweep_leased(engine, "controller-b", lease).await.unwrap().is_empty());

        release_leases(engine, "controller-a").await;
        assert_eq!(sweep_leased(engine, "controller-b", lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let state = test_state(EngineConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(5),
            run(&state.engine, Duration::from_secs(60), cancel),
        )
        .await
        .unwrap();
    }
}
