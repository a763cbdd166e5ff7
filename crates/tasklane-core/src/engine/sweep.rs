//! Bounded periodic sweeps and the scheduler hand-off.
//!
//! Each sweep handles at most its configured batch and reports
//! `should_continue` when the batch was full, so the ticker can call it again
//! right away.

use chrono::Duration;
use serde_json::json;
use tasklane_types::event::CandidateEvent;
use tasklane_types::matching::MatchEventType;
use tasklane_types::task::{TaskAssignment, TaskIdInsertedAtRetryCount, TenantId};
use uuid::Uuid;

use super::release::FailTaskOpts;
use super::{now, EngineError, TaskEngine};
use crate::repository::Gateway;

pub const TIMEOUT_ERROR: &str = "task exceeded its timeout";
pub const LEASE_EXPIRED_ERROR: &str = "worker lease expired";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub processed: usize,
    pub should_continue: bool,
}

impl SweepResult {
    fn new(processed: usize, limit: i64) -> Self {
        Self {
            processed,
            should_continue: limit > 0 && processed as i64 >= limit,
        }
    }
}

impl<G: Gateway> TaskEngine<G> {
    /// Fail running attempts whose timeout passed, as app errors.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_task_timeouts(&self, tenant: TenantId) -> Result<SweepResult, EngineError> {
        let limit = self.config.sweeps.timeouts;
        let mut ctx = self.begin(tenant).await?;
        let expired = self
            .gateway
            .list_timed_out(&mut ctx.tx, tenant, now(), limit)
            .await?;
        let opts = expired
            .iter()
            .map(|task| FailTaskOpts {
                task: *task,
                error_message: TIMEOUT_ERROR.to_string(),
                is_app_error: true,
                is_non_retryable: false,
            })
            .collect();
        self.fail_in(&mut ctx, opts).await?;
        self.finish(ctx).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "timed out tasks failed");
        }
        Ok(SweepResult::new(expired.len(), limit))
    }

    /// Fail running attempts whose worker lease expired, as internal errors.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_task_reassignments(
        &self,
        tenant: TenantId,
    ) -> Result<SweepResult, EngineError> {
        let limit = self.config.sweeps.reassignments;
        let mut ctx = self.begin(tenant).await?;
        let expired = self
            .gateway
            .list_expired_leases(&mut ctx.tx, tenant, now(), limit)
            .await?;
        let opts = expired
            .iter()
            .map(|task| FailTaskOpts {
                task: *task,
                error_message: LEASE_EXPIRED_ERROR.to_string(),
                is_app_error: false,
                is_non_retryable: false,
            })
            .collect();
        self.fail_in(&mut ctx, opts).await?;
        self.finish(ctx).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "tasks with expired leases failed");
        }
        Ok(SweepResult::new(expired.len(), limit))
    }

    /// Requeue retries whose backoff elapsed.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_task_retry_queue_items(
        &self,
        tenant: TenantId,
    ) -> Result<SweepResult, EngineError> {
        let limit = self.config.sweeps.retry_queue;
        let mut ctx = self.begin(tenant).await?;
        let requeued = self
            .gateway
            .requeue_ready_retries(&mut ctx.tx, tenant, now(), limit)
            .await?;
        self.finish(ctx).await?;
        Ok(SweepResult::new(requeued.len(), limit))
    }

    /// Turn expired durable sleeps into candidate events.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_durable_sleeps(&self, tenant: TenantId) -> Result<SweepResult, EngineError> {
        let limit = self.config.sweeps.durable_sleeps;
        let mut ctx = self.begin(tenant).await?;
        let sleeps = self
            .gateway
            .pop_expired_sleeps(&mut ctx.tx, tenant, now(), limit)
            .await?;
        ctx.pending.extend(sleeps.iter().map(|sleep| {
            let data = json!({
                "sleep_id": sleep.id,
                "sleep_duration_secs": sleep.sleep_duration_secs,
            });
            CandidateEvent {
                id: Uuid::now_v7(),
                timestamp: sleep.sleep_until,
                kind: MatchEventType::Internal,
                key: sleep.event_key(),
                resource_hint: None,
                data,
                output: None,
            }
        }));
        self.finish(ctx).await?;
        Ok(SweepResult::new(sleeps.len(), limit))
    }

    /// Hand queued attempts to a worker. Returns the attempts that were
    /// still queued and are now running.
    #[tracing::instrument(skip(self, attempts), fields(tenant_id = %tenant, count = attempts.len()))]
    pub async fn assign_tasks(
        &self,
        tenant: TenantId,
        worker_id: Uuid,
        attempts: &[TaskIdInsertedAtRetryCount],
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let keys: Vec<_> = attempts.iter().map(|a| a.key()).collect();
        let tasks = self.gateway.get_tasks(&mut ctx.tx, tenant, &keys).await?;

        let now = now();
        let lease_expires_at = now + Duration::seconds(self.config.lease_secs);
        let assignments: Vec<TaskAssignment> = attempts
            .iter()
            .filter_map(|attempt| {
                let task = tasks.iter().find(|t| t.key() == attempt.key())?;
                Some(TaskAssignment {
                    task: *attempt,
                    worker_id,
                    timeout_at: now + Duration::seconds(task.timeout_secs),
                    lease_expires_at,
                })
            })
            .collect();
        let assigned = self
            .gateway
            .assign_tasks(&mut ctx.tx, tenant, &assignments)
            .await?;
        self.finish(ctx).await?;
        Ok(assigned)
    }

    /// Queued attempts in dispatch order, for the external scheduler.
    pub async fn list_queued(
        &self,
        tenant: TenantId,
        limit: i64,
    ) -> Result<Vec<TaskIdInsertedAtRetryCount>, EngineError> {
        let mut tx = self.gateway.begin().await?;
        let queued = self.gateway.list_queued(&mut tx, tenant, limit).await;
        self.gateway.rollback(tx).await?;
        Ok(queued?)
    }
}
