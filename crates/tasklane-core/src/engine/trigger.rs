//! Triggering workflow runs.
//!
//! Steps are planned in step-id order. Parentless steps without extra
//! conditions become queued tasks right away; every other step becomes a
//! `TRIGGER` match that creates its task once the match fires.

use chrono::Duration;
use serde_json::{json, Value};
use tasklane_types::dag::{Dag, DagRef, NewDag};
use tasklane_types::error::RepositoryError;
use tasklane_types::event::{NewTaskEvent, TaskEventType};
use tasklane_types::idempotency::{IdempotencyClaim, IdempotencyKey};
use tasklane_types::matching::{Match, MatchTarget, NewMatch, TriggerTarget};
use tasklane_types::payload::{PayloadKey, PayloadType, StorePayload};
use tasklane_types::task::{ParentLink, Task, TaskInitialState, TaskInput, TenantId};
use tasklane_types::workflow::{JobKind, StepDefinition, WorkflowVersion};
use uuid::Uuid;

use super::create::CreateTaskOpts;
use super::{now, EngineError, TaskEngine, TxContext};
use crate::graph::StepGraph;
use crate::replay::on_failure_siblings;
use crate::repository::Gateway;
use crate::trigger::builder::{
    dag_task_external_id, extra_conditions, fan_in_conditions, on_failure_conditions,
    sleep_durations,
};
use crate::trigger::idempotency::{decide_claim, ClaimDecision};

#[derive(Debug, Clone)]
pub struct TriggerOpts {
    pub workflow_version_id: Uuid,
    /// External id of the run: the DAG's for multi-step versions, otherwise
    /// the single task's.
    pub external_id: Uuid,
    pub input: Value,
    pub priority: Option<i32>,
    pub additional_metadata: Option<Value>,
    pub parent: Option<ParentLink>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl TriggerOpts {
    pub fn new(workflow_version_id: Uuid, input: Value) -> Self {
        Self {
            workflow_version_id,
            external_id: Uuid::now_v7(),
            input,
            priority: None,
            additional_metadata: None,
            parent: None,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggeredRun {
    pub external_id: Uuid,
    pub dag: Option<Dag>,
    pub tasks: Vec<Task>,
    pub matches: Vec<Match>,
    /// The run already existed (idempotency key or child key) and nothing
    /// was created.
    pub reused: bool,
}

impl TriggeredRun {
    fn reused(external_id: Uuid) -> Self {
        Self {
            external_id,
            dag: None,
            tasks: Vec::new(),
            matches: Vec::new(),
            reused: true,
        }
    }
}

/// Event key recording that a parent task spawned a child run.
pub fn child_event_key(link: &ParentLink) -> String {
    format!(
        "child:{}:{}",
        link.child_index,
        link.child_key.as_deref().unwrap_or_default()
    )
}

struct RunPlan<'a> {
    version: &'a WorkflowVersion,
    opts: &'a TriggerOpts,
    dag: Option<DagRef>,
}

impl RunPlan<'_> {
    fn task_external_id(&self, readable_id: &str) -> Uuid {
        match self.dag {
            Some(dag) => dag_task_external_id(dag.external_id, readable_id),
            None => self.opts.external_id,
        }
    }

    fn target(&self, step: &StepDefinition) -> TriggerTarget {
        TriggerTarget {
            dag: self.dag,
            workflow_id: self.version.workflow_id,
            workflow_version_id: self.version.id,
            step_id: step.id,
            step_readable_id: step.readable_id.clone(),
            external_id: self.task_external_id(&step.readable_id),
            workflow_run_id: self.opts.external_id,
            priority: self.opts.priority,
            additional_metadata: self.opts.additional_metadata.clone(),
            parent: self.opts.parent.clone(),
            existing_task: None,
            input: TaskInput::new(self.opts.input.clone()),
        }
    }

    fn queued_task(&self, step: &StepDefinition) -> CreateTaskOpts {
        CreateTaskOpts {
            external_id: self.task_external_id(&step.readable_id),
            workflow_run_id: self.opts.external_id,
            workflow_version_id: self.version.id,
            step_id: step.id,
            dag: self.dag,
            input: TaskInput::new(self.opts.input.clone()),
            initial_state: TaskInitialState::Queued,
            initial_state_reason: None,
            priority: self.opts.priority,
            additional_metadata: self.opts.additional_metadata.clone(),
            parent: self.opts.parent.clone(),
        }
    }
}

impl<G: Gateway> TaskEngine<G> {
    /// Trigger workflow runs in one transaction.
    #[tracing::instrument(skip(self, opts), fields(tenant_id = %tenant, count = opts.len()))]
    pub async fn trigger_workflow_runs(
        &self,
        tenant: TenantId,
        opts: Vec<TriggerOpts>,
    ) -> Result<Vec<TriggeredRun>, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let mut runs = Vec::with_capacity(opts.len());
        for opt in &opts {
            runs.push(self.trigger_in(&mut ctx, opt).await?);
        }
        self.finish(ctx).await?;
        Ok(runs)
    }

    async fn trigger_in(
        &self,
        ctx: &mut TxContext<G::Tx>,
        opts: &TriggerOpts,
    ) -> Result<TriggeredRun, EngineError> {
        if let Some(key) = &opts.idempotency_key {
            if !self.claim_idempotency_key(ctx, key, opts.external_id).await? {
                return Ok(TriggeredRun::reused(opts.external_id));
            }
        }
        if let Some(link) = &opts.parent {
            if let Some(existing) = self.spawned_child(ctx, link, opts.external_id).await? {
                tracing::debug!(child_run_id = %existing, "child run already spawned");
                return Ok(TriggeredRun::reused(existing));
            }
        }

        let version = self.load_version(ctx, opts.workflow_version_id).await?;
        StepGraph::build(&version.steps).map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let dag = if version.is_dag() {
            let dag = self
                .gateway
                .insert_dags(
                    &mut ctx.tx,
                    ctx.tenant,
                    &[NewDag {
                        external_id: opts.external_id,
                        workflow_id: version.workflow_id,
                        workflow_version_id: version.id,
                        input: opts.input.clone(),
                        additional_metadata: opts.additional_metadata.clone(),
                        total_tasks: version.steps.len() as i32,
                        parent_task_external_id: opts.parent.as_ref().map(|p| p.external_id),
                    }],
                )
                .await?
                .into_iter()
                .next()
                .ok_or(RepositoryError::NotFound)?;
            self.gateway
                .store_payloads(
                    &mut ctx.tx,
                    ctx.tenant,
                    &[StorePayload {
                        key: PayloadKey::new(dag.id, dag.inserted_at, PayloadType::DagInput),
                        value: opts.input.clone(),
                    }],
                )
                .await?;
            Some(dag)
        } else {
            None
        };

        let plan = RunPlan {
            version: &version,
            opts,
            dag: dag.as_ref().map(Dag::dag_ref),
        };

        let mut creates = Vec::new();
        let mut new_matches = Vec::new();
        for step in version.sorted_steps() {
            let conditions = if step.job_kind == JobKind::OnFailure {
                let siblings: Vec<(&str, Uuid)> = on_failure_siblings(&version)
                    .into_iter()
                    .map(|id| (id, plan.task_external_id(id)))
                    .collect();
                on_failure_conditions(&siblings)
            } else if !step.parents.is_empty() {
                let parents: Vec<(&str, Uuid)> = step
                    .parents
                    .iter()
                    .map(|p| (p.as_str(), plan.task_external_id(p)))
                    .collect();
                fan_in_conditions(step, &parents)
            } else if step.has_extra_conditions() {
                let durations = sleep_durations(step.extra_conditions());
                let sleeps = self
                    .gateway
                    .insert_durable_sleeps(&mut ctx.tx, ctx.tenant, &durations)
                    .await?;
                let sleep_ids: Vec<i64> = sleeps.iter().map(|s| s.id).collect();
                extra_conditions(step, &sleep_ids)
            } else {
                creates.push(plan.queued_task(step));
                continue;
            };
            new_matches.push(NewMatch {
                target: MatchTarget::Trigger(Box::new(plan.target(step))),
                conditions,
            });
        }

        let tasks = self.create_tasks_in(ctx, creates).await?;
        let matches = if new_matches.is_empty() {
            Vec::new()
        } else {
            self.gateway
                .insert_matches(&mut ctx.tx, ctx.tenant, &new_matches)
                .await?
        };
        tracing::info!(
            run_id = %opts.external_id,
            workflow = %version.workflow_name,
            tasks = tasks.len(),
            matches = matches.len(),
            "workflow run triggered"
        );
        Ok(TriggeredRun {
            external_id: opts.external_id,
            dag,
            tasks,
            matches,
            reused: false,
        })
    }

    /// Take or confirm the claim on `key` for `requester`. Returns false when
    /// the requester already holds it, i.e. the run exists.
    async fn claim_idempotency_key(
        &self,
        ctx: &mut TxContext<G::Tx>,
        key: &IdempotencyKey,
        requester: Uuid,
    ) -> Result<bool, EngineError> {
        let now = now();
        let existing = self
            .gateway
            .get_idempotency_claim(&mut ctx.tx, ctx.tenant, key)
            .await?;
        let interval = Duration::seconds(self.config.idempotency_recheck_interval_secs);
        let claimant = match decide_claim(existing.as_ref(), requester, now, interval) {
            ClaimDecision::Claim => None,
            ClaimDecision::Held => return Ok(false),
            ClaimDecision::Recheck { claimant } => Some(claimant),
            ClaimDecision::Rejected { claimant } => {
                return Err(EngineError::AlreadyClaimed {
                    key: key.to_string(),
                    claimed_by: claimant,
                });
            }
        };
        if let Some(claimant) = claimant {
            let finalized = self
                .finalized_runs(&mut ctx.tx, ctx.tenant, &[claimant])
                .await?;
            if finalized.is_empty() {
                return Err(EngineError::AlreadyClaimed {
                    key: key.to_string(),
                    claimed_by: claimant,
                });
            }
            tracing::info!(previous_run_id = %claimant, "idempotency key reclaimed from finalized run");
        }
        self.gateway
            .put_idempotency_claim(
                &mut ctx.tx,
                &IdempotencyClaim {
                    tenant_id: ctx.tenant,
                    key: key.clone(),
                    claimed_by: requester,
                    claimed_at: now,
                    last_checked_at: now,
                },
            )
            .await?;
        Ok(true)
    }

    /// The child run already spawned for `link`, or `None` after recording
    /// the spawn of `child_external_id` on the parent task.
    async fn spawned_child(
        &self,
        ctx: &mut TxContext<G::Tx>,
        link: &ParentLink,
        child_external_id: Uuid,
    ) -> Result<Option<Uuid>, EngineError> {
        let event_key = child_event_key(link);
        let recorded = self
            .gateway
            .list_task_events(
                &mut ctx.tx,
                ctx.tenant,
                link.task.key(),
                TaskEventType::SignalCreated,
                Some(&event_key),
            )
            .await?;
        if let Some(event) = recorded.first() {
            let key = PayloadKey::new(event.id, event.inserted_at, PayloadType::TaskEventData);
            let payloads = self
                .gateway
                .retrieve_payloads(&mut ctx.tx, ctx.tenant, &[key])
                .await?;
            let existing = payloads
                .get(&key)
                .and_then(|data| data.get("external_id"))
                .and_then(Value::as_str)
                .and_then(|id| Uuid::parse_str(id).ok());
            if existing.is_some() {
                return Ok(existing);
            }
            tracing::warn!(event_key = %event_key, "child spawn record has no external id");
        }

        self.write_events(
            ctx,
            vec![NewTaskEvent {
                task: link.task,
                task_external_id: link.external_id,
                event_type: TaskEventType::SignalCreated,
                event_key: Some(event_key),
                data: json!({ "external_id": child_external_id }),
                is_current_retry: true,
            }],
        )
        .await?;
        Ok(None)
    }
}
