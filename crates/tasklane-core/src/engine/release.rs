//! Releasing attempts into terminal states.
//!
//! A release is guarded on `(id, retry_count)`: a stale or repeated release
//! changes nothing and is dropped silently. Only a task row that does not
//! exist at all is an error.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tasklane_types::event::{NewTaskEvent, TaskEventType};
use tasklane_types::task::{
    RetryPolicy, ScheduledRetry, Task, TaskIdInsertedAtRetryCount, TaskStatus, TenantId,
};

use super::{now, EngineError, TaskEngine, TxContext};
use crate::repository::Gateway;

#[derive(Debug, Clone)]
pub struct CompleteTaskOpts {
    pub task: TaskIdInsertedAtRetryCount,
    pub output: Value,
}

#[derive(Debug, Clone)]
pub struct FailTaskOpts {
    pub task: TaskIdInsertedAtRetryCount,
    pub error_message: String,
    /// Raised by the step itself; retried under the step's retry policy.
    /// Otherwise an engine-level failure, retried up to the global limit.
    pub is_app_error: bool,
    pub is_non_retryable: bool,
}

#[derive(Debug, Clone)]
pub struct CancelTaskOpts {
    pub task: TaskIdInsertedAtRetryCount,
    pub reason: Option<String>,
}

/// Result of a failure batch: attempts that stay failed and attempts that
/// were retried (their new attempt).
#[derive(Debug, Clone, Default)]
pub struct FailOutcome {
    pub failed: Vec<Task>,
    pub retried: Vec<Task>,
}

/// Backoff deadline of an app retry, or `None` to retry immediately.
pub fn retry_after(policy: &RetryPolicy, retry_count: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let factor = policy.backoff_factor?;
    let mut secs = factor.powi(retry_count);
    if let Some(max) = policy.max_backoff_secs {
        secs = secs.min(max as f64);
    }
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Some(now + Duration::milliseconds((secs * 1000.0) as i64))
}

impl<G: Gateway> TaskEngine<G> {
    /// Release attempts with `status`. Attempts that were not released by
    /// this call are dropped from the result.
    async fn release(
        &self,
        ctx: &mut TxContext<G::Tx>,
        attempts: &[TaskIdInsertedAtRetryCount],
        status: TaskStatus,
    ) -> Result<Vec<(usize, Task)>, EngineError> {
        let results = self
            .gateway
            .release_tasks(&mut ctx.tx, ctx.tenant, attempts, status)
            .await?;
        let found = results.iter().filter(|r| r.is_some()).count();
        if found != attempts.len() {
            return Err(EngineError::PartialRelease {
                expected: attempts.len(),
                released: found,
            });
        }
        let released: Vec<(usize, Task)> = results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.filter(|r| r.released).map(|r| (i, r.task)))
            .collect();
        if released.len() < attempts.len() {
            tracing::debug!(
                dropped = attempts.len() - released.len(),
                status = %status,
                "stale or repeated releases dropped"
            );
        }

        let retired: Vec<_> = released.iter().map(|(_, t)| t.attempt()).collect();
        if !retired.is_empty() {
            let closed = self
                .gateway
                .delete_signal_matches(&mut ctx.tx, ctx.tenant, &retired)
                .await?;
            if closed > 0 {
                tracing::debug!(closed, "open waits of released attempts removed");
            }
        }
        Ok(released)
    }

    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, count = opts.len()))]
    pub async fn complete_tasks(
        &self,
        tenant: TenantId,
        opts: Vec<CompleteTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let tasks = self.complete_in(&mut ctx, opts).await?;
        self.finish(ctx).await?;
        Ok(tasks)
    }

    pub(crate) async fn complete_in(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: Vec<CompleteTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        let attempts: Vec<_> = opts.iter().map(|o| o.task).collect();
        let released = self.release(ctx, &attempts, TaskStatus::Completed).await?;

        let events = released
            .iter()
            .map(|(i, task)| NewTaskEvent {
                task: task.attempt(),
                task_external_id: task.external_id,
                event_type: TaskEventType::Completed,
                event_key: None,
                data: opts[*i].output.clone(),
                is_current_retry: true,
            })
            .collect();
        self.write_events(ctx, events).await?;
        Ok(released.into_iter().map(|(_, t)| t).collect())
    }

    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, count = opts.len()))]
    pub async fn fail_tasks(
        &self,
        tenant: TenantId,
        opts: Vec<FailTaskOpts>,
    ) -> Result<FailOutcome, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let outcome = self.fail_in(&mut ctx, opts).await?;
        self.finish(ctx).await?;
        Ok(outcome)
    }

    pub(crate) async fn fail_in(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: Vec<FailTaskOpts>,
    ) -> Result<FailOutcome, EngineError> {
        let attempts: Vec<_> = opts.iter().map(|o| o.task).collect();
        let released = self.release(ctx, &attempts, TaskStatus::Failed).await?;

        let now = now();
        let mut retries = Vec::new();
        let mut failed = Vec::new();
        let mut events = Vec::with_capacity(released.len());
        for (i, task) in released {
            let opt = &opts[i];
            let retry = if opt.is_app_error {
                (!opt.is_non_retryable && task.retry_count < task.retry_policy.max_retries).then(|| {
                    ScheduledRetry {
                        task: task.attempt(),
                        is_internal: false,
                        retry_after: retry_after(&task.retry_policy, task.retry_count, now),
                    }
                })
            } else {
                (task.internal_retry_count < self.config.max_internal_retry_count).then(|| {
                    ScheduledRetry {
                        task: task.attempt(),
                        is_internal: true,
                        retry_after: None,
                    }
                })
            };

            events.push(NewTaskEvent {
                task: task.attempt(),
                task_external_id: task.external_id,
                event_type: TaskEventType::Failed,
                event_key: None,
                data: json!({
                    "error_message": opt.error_message,
                    "is_app_error": opt.is_app_error,
                }),
                is_current_retry: retry.is_none(),
            });
            match retry {
                Some(retry) => retries.push(retry),
                None => failed.push(task),
            }
        }

        self.write_events(ctx, events).await?;
        let retried = self
            .gateway
            .schedule_retries(&mut ctx.tx, ctx.tenant, &retries)
            .await?;
        if !retried.is_empty() {
            tracing::info!(retried = retried.len(), "failed attempts scheduled for retry");
        }
        Ok(FailOutcome { failed, retried })
    }

    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, count = opts.len()))]
    pub async fn cancel_tasks(
        &self,
        tenant: TenantId,
        opts: Vec<CancelTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let attempts: Vec<_> = opts.iter().map(|o| o.task).collect();
        let released = self.release(&mut ctx, &attempts, TaskStatus::Cancelled).await?;

        let events = released
            .iter()
            .map(|(i, task)| NewTaskEvent {
                task: task.attempt(),
                task_external_id: task.external_id,
                event_type: TaskEventType::Cancelled,
                event_key: None,
                data: json!({ "reason": opts[*i].reason }),
                is_current_retry: true,
            })
            .collect();
        self.write_events(&mut ctx, events).await?;
        self.finish(ctx).await?;
        Ok(released.into_iter().map(|(_, t)| t).collect())
    }
}
