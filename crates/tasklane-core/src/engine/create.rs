//! Task creation and in-place replay.
//!
//! Concurrency keys and step expressions are evaluated per task against its
//! input and metadata. A rule that fails sends that task (and only that task)
//! to `FAILED` with the error as the reason.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};
use tasklane_types::dag::DagRef;
use tasklane_types::event::{NewTaskEvent, TaskEventType};
use tasklane_types::payload::{PayloadKey, PayloadType, StorePayload};
use tasklane_types::task::{
    NewTask, ParentLink, ReplayTask, Task, TaskIdInsertedAt, TaskInitialState, TaskInput, TenantId,
};
use tasklane_types::workflow::{StepDefinition, DEFAULT_PRIORITY};
use uuid::Uuid;

use super::{decode, encode, EngineError, TaskEngine, TxContext};
use crate::expression::{CachedEvaluator, ExpressionError};
use crate::limiter::MeteredResource;
use crate::repository::Gateway;
use crate::trigger::builder::skipped_output;

#[derive(Debug, Clone)]
pub struct CreateTaskOpts {
    pub external_id: Uuid,
    pub workflow_run_id: Uuid,
    pub workflow_version_id: Uuid,
    pub step_id: Uuid,
    pub dag: Option<DagRef>,
    pub input: TaskInput,
    pub initial_state: TaskInitialState,
    pub initial_state_reason: Option<String>,
    pub priority: Option<i32>,
    pub additional_metadata: Option<Value>,
    pub parent: Option<ParentLink>,
}

impl CreateTaskOpts {
    /// A queued single-step task whose run id is its own external id.
    pub fn queued(workflow_version_id: Uuid, step_id: Uuid, input: Value) -> Self {
        let external_id = Uuid::now_v7();
        Self {
            external_id,
            workflow_run_id: external_id,
            workflow_version_id,
            step_id,
            dag: None,
            input: TaskInput::new(input),
            initial_state: TaskInitialState::Queued,
            initial_state_reason: None,
            priority: None,
            additional_metadata: None,
            parent: None,
        }
    }
}

/// Replay of an existing task. Without `input` the stored input is reused.
#[derive(Debug, Clone)]
pub struct ReplayTaskOpts {
    pub task: TaskIdInsertedAt,
    pub input: Option<TaskInput>,
    pub initial_state: TaskInitialState,
    pub initial_state_reason: Option<String>,
}

type RuleValues = (Vec<String>, BTreeMap<String, Value>);

fn rule_scope(input: &TaskInput, additional_metadata: Option<&Value>) -> Value {
    json!({
        "input": input.input,
        "parents": input.parents,
        "additional_metadata": additional_metadata.cloned().unwrap_or_else(|| json!({})),
    })
}

/// Concurrency keys and step expression values of one task.
pub(crate) fn evaluate_step_rules(
    evaluator: &CachedEvaluator,
    step: &StepDefinition,
    scope: &Value,
) -> Result<RuleValues, ExpressionError> {
    let keys = step
        .concurrency
        .iter()
        .map(|rule| evaluator.evaluate_string(&rule.expression, scope))
        .collect::<Result<Vec<_>, _>>()?;
    let mut values = BTreeMap::new();
    for expression in &step.expressions {
        let value = evaluator.evaluate_value(&expression.expression, scope)?;
        values.insert(expression.key.clone(), value);
    }
    Ok((keys, values))
}

/// Terminal event written at creation for tasks that never run.
pub(crate) fn initial_state_event(
    state: TaskInitialState,
    reason: Option<&str>,
) -> Option<(TaskEventType, Value)> {
    match state {
        TaskInitialState::Queued => None,
        TaskInitialState::Failed => Some((
            TaskEventType::Failed,
            json!({ "error_message": reason.unwrap_or("task failed before it started") }),
        )),
        TaskInitialState::Cancelled => Some((TaskEventType::Cancelled, json!({ "reason": reason }))),
        TaskInitialState::Skipped => Some((TaskEventType::Completed, skipped_output())),
    }
}

fn initial_events(tasks: &[Task]) -> Vec<NewTaskEvent> {
    tasks
        .iter()
        .filter_map(|task| {
            let (event_type, data) =
                initial_state_event(task.initial_state, task.initial_state_reason.as_deref())?;
            Some(NewTaskEvent {
                task: task.attempt(),
                task_external_id: task.external_id,
                event_type,
                event_key: None,
                data,
                is_current_retry: true,
            })
        })
        .collect()
}

impl<G: Gateway> TaskEngine<G> {
    /// Evaluate the step's rules, failing a queued task when one errors.
    fn apply_step_rules(
        &self,
        step: &StepDefinition,
        scope: &Value,
        state: &mut TaskInitialState,
        reason: &mut Option<String>,
    ) -> RuleValues {
        match evaluate_step_rules(&self.evaluator, step, scope) {
            Ok(values) => values,
            Err(err) => {
                if *state == TaskInitialState::Queued {
                    tracing::warn!(
                        step = %step.readable_id,
                        error = %err,
                        "step rule failed, creating task as failed"
                    );
                    *state = TaskInitialState::Failed;
                    *reason = Some(err.to_string());
                }
                (Vec::new(), BTreeMap::new())
            }
        }
    }

    /// Create tasks in one transaction.
    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, count = opts.len()))]
    pub async fn create_tasks(
        &self,
        tenant: TenantId,
        opts: Vec<CreateTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let tasks = self.create_tasks_in(&mut ctx, opts).await?;
        self.finish(ctx).await?;
        Ok(tasks)
    }

    pub(crate) async fn create_tasks_in(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: Vec<CreateTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        if opts.is_empty() {
            return Ok(Vec::new());
        }
        let version_ids: Vec<Uuid> = opts.iter().map(|o| o.workflow_version_id).collect();
        let versions = self.load_versions(ctx, &version_ids).await?;

        let mut rows = Vec::with_capacity(opts.len());
        for opt in &opts {
            let version = versions
                .get(&opt.workflow_version_id)
                .ok_or(EngineError::UnknownWorkflowVersion(opt.workflow_version_id))?;
            let step = version
                .step(opt.step_id)
                .ok_or(EngineError::UnknownStep(opt.step_id))?;

            let mut initial_state = opt.initial_state;
            let mut reason = opt.initial_state_reason.clone();
            let scope = rule_scope(&opt.input, opt.additional_metadata.as_ref());
            let (concurrency_keys, step_expression_values) =
                self.apply_step_rules(step, &scope, &mut initial_state, &mut reason);

            rows.push(NewTask {
                external_id: opt.external_id,
                workflow_id: version.workflow_id,
                workflow_version_id: version.id,
                workflow_run_id: opt.workflow_run_id,
                step_id: step.id,
                step_readable_id: step.readable_id.clone(),
                action_id: step.action_id.clone(),
                dag: opt.dag,
                initial_state,
                initial_state_reason: reason,
                priority: opt.priority.or(step.priority).unwrap_or(DEFAULT_PRIORITY),
                queue: step.queue.clone(),
                concurrency_keys,
                step_expression_values,
                parent: opt.parent.clone(),
                retry_policy: step.retry_policy(),
                timeout_secs: step.timeout_secs,
                additional_metadata: opt.additional_metadata.clone(),
            });
        }

        self.ensure_queues(ctx, rows.iter().map(|r| r.queue.clone()))
            .await?;
        let tasks = self
            .gateway
            .insert_tasks(&mut ctx.tx, ctx.tenant, &rows)
            .await?;

        let payloads = tasks
            .iter()
            .zip(&opts)
            .map(|(task, opt)| {
                Ok(StorePayload {
                    key: PayloadKey::new(task.id, task.inserted_at, PayloadType::TaskInput),
                    value: encode(&opt.input)?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        self.gateway
            .store_payloads(&mut ctx.tx, ctx.tenant, &payloads)
            .await?;

        self.write_events(ctx, initial_events(&tasks)).await?;
        ctx.meter(MeteredResource::TaskRun, tasks.len());
        tracing::debug!(created = tasks.len(), "tasks created");
        Ok(tasks)
    }

    /// Replay existing tasks in place: a new attempt with fresh rule values.
    pub(crate) async fn replay_in_place(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: Vec<ReplayTaskOpts>,
    ) -> Result<Vec<Task>, EngineError> {
        if opts.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<TaskIdInsertedAt> = opts.iter().map(|o| o.task).collect();
        let existing: HashMap<TaskIdInsertedAt, Task> = self
            .gateway
            .get_tasks(&mut ctx.tx, ctx.tenant, &keys)
            .await?
            .into_iter()
            .map(|t| (t.key(), t))
            .collect();

        let stored_keys: Vec<PayloadKey> = opts
            .iter()
            .filter(|o| o.input.is_none())
            .map(|o| PayloadKey::new(o.task.id, o.task.inserted_at, PayloadType::TaskInput))
            .collect();
        let mut stored = self
            .gateway
            .retrieve_payloads(&mut ctx.tx, ctx.tenant, &stored_keys)
            .await?;

        let version_ids: Vec<Uuid> = existing.values().map(|t| t.workflow_version_id).collect();
        let versions = self.load_versions(ctx, &version_ids).await?;

        let mut rows = Vec::with_capacity(opts.len());
        let mut new_inputs = Vec::new();
        for opt in opts {
            let Some(task) = existing.get(&opt.task) else {
                tracing::warn!(task_id = opt.task.id, "replay target no longer exists, skipping");
                continue;
            };
            let version = versions
                .get(&task.workflow_version_id)
                .ok_or(EngineError::UnknownWorkflowVersion(task.workflow_version_id))?;
            let step = version
                .step(task.step_id)
                .ok_or(EngineError::UnknownStep(task.step_id))?;

            let replacing_input = opt.input.is_some();
            let input = match opt.input {
                Some(input) => input,
                None => {
                    let key = PayloadKey::new(task.id, task.inserted_at, PayloadType::TaskInput);
                    match stored.remove(&key) {
                        Some(value) => decode(value)?,
                        None => TaskInput::default(),
                    }
                }
            };

            let mut initial_state = opt.initial_state;
            let mut reason = opt.initial_state_reason;
            let scope = rule_scope(&input, task.additional_metadata.as_ref());
            let (concurrency_keys, step_expression_values) =
                self.apply_step_rules(step, &scope, &mut initial_state, &mut reason);

            rows.push(ReplayTask {
                task: opt.task,
                initial_state,
                initial_state_reason: reason,
                concurrency_keys,
                step_expression_values,
            });
            if replacing_input {
                new_inputs.push(StorePayload {
                    key: PayloadKey::new(task.id, task.inserted_at, PayloadType::TaskInput),
                    value: encode(&input)?,
                });
            }
        }

        let tasks = self
            .gateway
            .replay_tasks(&mut ctx.tx, ctx.tenant, &rows)
            .await?;
        self.gateway
            .store_payloads(&mut ctx.tx, ctx.tenant, &new_inputs)
            .await?;

        self.write_events(ctx, initial_events(&tasks)).await?;
        ctx.meter(MeteredResource::TaskRun, tasks.len());
        tracing::debug!(replayed = tasks.len(), "tasks replayed in place");
        Ok(tasks)
    }
}
