//! Durable waits and sleeps registered by running tasks.
//!
//! A wait is a `SIGNAL` match on the waiting task plus a `SIGNAL_CREATED`
//! event keyed by the signal key. When the match fires the task receives a
//! `SIGNAL_COMPLETED` event with the same key carrying the satisfied data.

use serde_json::json;
use tasklane_types::event::{NewTaskEvent, TaskEventType};
use tasklane_types::matching::{MatchAction, MatchTarget, NewMatch, SignalTarget};
use tasklane_types::task::{TaskIdInsertedAtRetryCount, TenantId};
use tasklane_types::workflow::{StepCondition, StepConditionKind};
use uuid::Uuid;

use super::{EngineError, TaskEngine, TxContext};
use crate::repository::Gateway;
use crate::trigger::builder::{sleep_durations, wait_conditions};
use crate::trigger::idempotency::wait_for_key;

#[derive(Debug, Clone)]
pub struct DurableWaitOpts {
    pub task: TaskIdInsertedAtRetryCount,
    /// Defaults to a key derived from the conditions.
    pub signal_key: Option<String>,
    pub conditions: Vec<StepCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableWait {
    pub signal_key: String,
    /// False when the attempt had already registered this wait.
    pub created: bool,
}

const SLEEP_KEY_PREFIX: &str = "sleep:";

/// Signal key of the `ordinal`-th sleep of an attempt.
pub fn sleep_signal_key(ordinal: usize) -> String {
    format!("{SLEEP_KEY_PREFIX}{ordinal}")
}

fn is_sleep_key(key: Option<&str>) -> bool {
    key.is_some_and(|k| k.starts_with(SLEEP_KEY_PREFIX))
}

impl<G: Gateway> TaskEngine<G> {
    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, task_id = opts.task.id))]
    pub async fn register_durable_wait(
        &self,
        tenant: TenantId,
        opts: DurableWaitOpts,
    ) -> Result<DurableWait, EngineError> {
        if opts.conditions.is_empty() {
            return Err(EngineError::InvalidInput("a wait needs at least one condition".to_string()));
        }
        if opts.conditions.iter().any(StepCondition::is_parent_override) {
            return Err(EngineError::InvalidInput(
                "parent overrides cannot be waited on".to_string(),
            ));
        }
        let signal_key = opts
            .signal_key
            .clone()
            .unwrap_or_else(|| wait_for_key(&opts.conditions).0);

        let mut ctx = self.begin(tenant).await?;
        let wait = self.register_wait_in(&mut ctx, opts, signal_key).await?;
        self.finish(ctx).await?;
        Ok(wait)
    }

    /// Register a durable sleep of `sleep_for_secs` for a running attempt.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant, task_id = task.id))]
    pub async fn register_durable_sleep(
        &self,
        tenant: TenantId,
        task: TaskIdInsertedAtRetryCount,
        sleep_for_secs: i64,
    ) -> Result<DurableWait, EngineError> {
        if sleep_for_secs < 0 {
            return Err(EngineError::InvalidInput("sleep duration cannot be negative".to_string()));
        }
        let mut ctx = self.begin(tenant).await?;
        let registered = self
            .gateway
            .list_task_events(&mut ctx.tx, tenant, task.key(), TaskEventType::SignalCreated, None)
            .await?
            .iter()
            .filter(|e| e.retry_count == task.retry_count && is_sleep_key(e.event_key.as_deref()))
            .count();
        let signal_key = sleep_signal_key(registered);
        let opts = DurableWaitOpts {
            task,
            signal_key: Some(signal_key.clone()),
            conditions: vec![StepCondition {
                or_group_id: Uuid::now_v7(),
                readable_data_key: signal_key.clone(),
                action: MatchAction::Create,
                expression: "true".to_string(),
                kind: StepConditionKind::Sleep { sleep_for_secs },
            }],
        };
        let wait = self.register_wait_in(&mut ctx, opts, signal_key).await?;
        self.finish(ctx).await?;
        Ok(wait)
    }

    async fn register_wait_in(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: DurableWaitOpts,
        signal_key: String,
    ) -> Result<DurableWait, EngineError> {
        let task = self
            .gateway
            .get_tasks(&mut ctx.tx, ctx.tenant, &[opts.task.key()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidInput(format!("task {} does not exist", opts.task.id)))?;
        if task.retry_count != opts.task.retry_count || task.status.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "attempt {} of task {} is not running",
                opts.task.retry_count, opts.task.id
            )));
        }

        let already = self
            .gateway
            .list_task_events(
                &mut ctx.tx,
                ctx.tenant,
                task.key(),
                TaskEventType::SignalCreated,
                Some(&signal_key),
            )
            .await?
            .iter()
            .any(|e| e.retry_count == task.retry_count && e.is_current_retry);
        if already {
            tracing::debug!(signal_key = %signal_key, "wait already registered for this attempt");
            return Ok(DurableWait {
                signal_key,
                created: false,
            });
        }

        let durations = sleep_durations(&opts.conditions);
        let sleeps = self
            .gateway
            .insert_durable_sleeps(&mut ctx.tx, ctx.tenant, &durations)
            .await?;
        let sleep_ids: Vec<i64> = sleeps.iter().map(|s| s.id).collect();
        let mut conditions = wait_conditions(&opts.conditions, &sleep_ids);
        for condition in &mut conditions {
            condition.action = MatchAction::Create;
        }

        self.gateway
            .insert_matches(
                &mut ctx.tx,
                ctx.tenant,
                &[NewMatch {
                    target: MatchTarget::Signal(SignalTarget {
                        task: task.attempt(),
                        external_id: task.external_id,
                        signal_key: signal_key.clone(),
                    }),
                    conditions,
                }],
            )
            .await?;

        self.write_events(
            ctx,
            vec![NewTaskEvent {
                task: task.attempt(),
                task_external_id: task.external_id,
                event_type: TaskEventType::SignalCreated,
                event_key: Some(signal_key.clone()),
                data: json!({ "signal_key": signal_key }),
                is_current_retry: true,
            }],
        )
        .await?;
        tracing::info!(signal_key = %signal_key, sleeps = sleep_ids.len(), "durable wait registered");
        Ok(DurableWait {
            signal_key,
            created: true,
        })
    }
}
