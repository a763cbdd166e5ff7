//! Replaying finalized runs from a set of tasks.
//!
//! The requested tasks and everything downstream of them run again. Subtree
//! roots are replayed in place right away; the rest get fresh fan-in matches
//! targeting their existing task, with conditions on parents outside the
//! subtree pre-satisfied from the parents' last outcome.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tasklane_types::dag::Dag;
use tasklane_types::matching::{MatchTarget, NewMatch, TriggerTarget};
use tasklane_types::payload::{PayloadKey, PayloadType};
use tasklane_types::task::{Task, TaskIdInsertedAt, TaskInitialState, TaskInput, TenantId};
use tasklane_types::workflow::{JobKind, WorkflowVersion};
use uuid::Uuid;

use super::create::ReplayTaskOpts;
use super::{EngineError, TaskEngine, TxContext};
use crate::graph::StepGraph;
use crate::hash::advisory_lock_key;
use crate::replay::{
    on_failure_siblings, preflight, presatisfy_outside_parents, replay_subtree, HistoricalOutcome,
};
use crate::repository::Gateway;
use crate::trigger::builder::{fan_in_conditions, on_failure_conditions};

pub const REPLAY_LOCK: &str = "replay-tasks";

/// Lock name guarding one workflow run against concurrent replays.
pub fn run_lock_name(run_id: Uuid) -> String {
    format!("run:{run_id}")
}

fn run_lock(tenant: TenantId, run_id: Uuid) -> i64 {
    advisory_lock_key(tenant, &run_lock_name(run_id))
}

#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    /// False when another replay held the tenant lock; nothing was done.
    pub acquired: bool,
    /// Subtree roots replayed in place.
    pub replayed: Vec<Task>,
    /// Downstream tasks now waiting on their parents again.
    pub deferred: Vec<TaskIdInsertedAt>,
    /// Requested tasks left alone: unknown, locked or not finalized.
    pub discarded: Vec<TaskIdInsertedAt>,
}

impl<G: Gateway> TaskEngine<G> {
    #[tracing::instrument(skip(self, keys), fields(tenant_id = %tenant, count = keys.len()))]
    pub async fn replay_tasks(
        &self,
        tenant: TenantId,
        keys: &[TaskIdInsertedAt],
    ) -> Result<ReplayResult, EngineError> {
        let mut ctx = self.begin(tenant).await?;
        let lock = advisory_lock_key(tenant, REPLAY_LOCK);
        if self
            .gateway
            .try_advisory_locks(&mut ctx.tx, &[lock])
            .await?
            .is_empty()
        {
            self.gateway.rollback(ctx.tx).await?;
            tracing::info!("another replay holds the tenant lock");
            return Ok(ReplayResult::default());
        }

        let mut result = ReplayResult {
            acquired: true,
            ..ReplayResult::default()
        };
        let requested = self.gateway.get_tasks(&mut ctx.tx, tenant, keys).await?;
        for key in keys {
            if !requested.iter().any(|t| t.key() == *key) {
                result.discarded.push(*key);
            }
        }

        let mut by_run: BTreeMap<Uuid, Vec<&Task>> = BTreeMap::new();
        for task in &requested {
            by_run.entry(task.workflow_run_id).or_default().push(task);
        }

        let run_ids: Vec<Uuid> = by_run.keys().copied().collect();
        let lock_keys: Vec<i64> = run_ids.iter().map(|id| run_lock(tenant, *id)).collect();
        let locked = self
            .gateway
            .try_advisory_locks(&mut ctx.tx, &lock_keys)
            .await?;
        let mut lockable = Vec::new();
        for (run_id, lock_key) in run_ids.iter().zip(&lock_keys) {
            if locked.contains(lock_key) {
                lockable.push(*run_id);
            } else {
                tracing::warn!(run_id = %run_id, "run is locked by another operation, discarding");
                result
                    .discarded
                    .extend(by_run[run_id].iter().map(|t| t.key()));
            }
        }
        if lockable.is_empty() {
            self.finish(ctx).await?;
            return Ok(result);
        }

        let all_tasks = self
            .gateway
            .list_tasks_for_runs(&mut ctx.tx, tenant, &lockable)
            .await?;
        let dags: HashMap<Uuid, Dag> = self
            .gateway
            .get_dags_by_external_ids(&mut ctx.tx, tenant, &lockable)
            .await?
            .into_iter()
            .map(|d| (d.external_id, d))
            .collect();

        for run_id in lockable {
            let run_tasks: Vec<&Task> = all_tasks
                .iter()
                .filter(|t| t.workflow_run_id == run_id)
                .collect();
            let dag = dags.get(&run_id);
            let step_count = dag.map(|d| d.total_tasks.max(0) as usize).unwrap_or(1);
            if !preflight(&run_tasks, step_count) {
                tracing::warn!(run_id = %run_id, "run is not finalized, discarding replay");
                result
                    .discarded
                    .extend(by_run[&run_id].iter().map(|t| t.key()));
                continue;
            }

            let version = self
                .load_version(&mut ctx, run_tasks[0].workflow_version_id)
                .await?;
            let requested_steps: Vec<&str> = by_run[&run_id]
                .iter()
                .map(|t| t.step_readable_id.as_str())
                .collect();
            self.replay_run(&mut ctx, &version, dag, &run_tasks, &requested_steps, &mut result)
                .await?;
        }

        self.finish(ctx).await?;
        tracing::info!(
            replayed = result.replayed.len(),
            deferred = result.deferred.len(),
            discarded = result.discarded.len(),
            "replay finished"
        );
        Ok(result)
    }

    async fn replay_run(
        &self,
        ctx: &mut TxContext<G::Tx>,
        version: &WorkflowVersion,
        dag: Option<&Dag>,
        run_tasks: &[&Task],
        requested: &[&str],
        result: &mut ReplayResult,
    ) -> Result<(), EngineError> {
        let graph =
            StepGraph::build(&version.steps).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        let subtree = replay_subtree(version, &graph, requested);
        let roots = graph.subtree_roots(&subtree);
        let task_of: HashMap<&str, &Task> = run_tasks
            .iter()
            .map(|t| (t.step_readable_id.as_str(), *t))
            .collect();

        // Outcomes must be read before any task of the run is reset.
        let keys: Vec<TaskIdInsertedAt> = run_tasks.iter().map(|t| t.key()).collect();
        let events = self
            .gateway
            .list_current_terminal_events(&mut ctx.tx, ctx.tenant, &keys)
            .await?;
        let payload_keys: Vec<PayloadKey> = events
            .iter()
            .map(|e| PayloadKey::new(e.id, e.inserted_at, PayloadType::TaskEventData))
            .collect();
        let mut payloads = self
            .gateway
            .retrieve_payloads(&mut ctx.tx, ctx.tenant, &payload_keys)
            .await?;
        let mut history: HashMap<&str, HistoricalOutcome> = HashMap::new();
        for event in events {
            let Some(task) = run_tasks.iter().find(|t| t.key() == event.task_key()) else {
                continue;
            };
            let key = PayloadKey::new(event.id, event.inserted_at, PayloadType::TaskEventData);
            let data = payloads.remove(&key).unwrap_or(Value::Null);
            history.insert(task.step_readable_id.as_str(), HistoricalOutcome { event, data });
        }

        let root_opts: Vec<ReplayTaskOpts> = roots
            .iter()
            .filter_map(|step| task_of.get(step.readable_id.as_str()))
            .map(|task| ReplayTaskOpts {
                task: task.key(),
                input: None,
                initial_state: TaskInitialState::Queued,
                initial_state_reason: None,
            })
            .collect();
        let replayed = self.replay_in_place(ctx, root_opts).await?;
        result.replayed.extend(replayed);

        let root_ids: HashSet<&str> = roots.iter().map(|s| s.readable_id.as_str()).collect();
        let downstream: Vec<&Task> = version
            .sorted_steps()
            .into_iter()
            .filter(|s| subtree.contains(s.readable_id.as_str()))
            .filter(|s| !root_ids.contains(s.readable_id.as_str()))
            .filter_map(|s| task_of.get(s.readable_id.as_str()).copied())
            .collect();
        if downstream.is_empty() {
            return Ok(());
        }

        let downstream_keys: Vec<TaskIdInsertedAt> = downstream.iter().map(|t| t.key()).collect();
        self.gateway
            .reset_for_replay(&mut ctx.tx, ctx.tenant, &downstream_keys)
            .await?;

        let run_input = match dag {
            Some(dag) => {
                let key = PayloadKey::new(dag.id, dag.inserted_at, PayloadType::DagInput);
                self.gateway
                    .retrieve_payloads(&mut ctx.tx, ctx.tenant, &[key])
                    .await?
                    .remove(&key)
                    .unwrap_or(Value::Null)
            }
            None => Value::Null,
        };
        let external_id = |readable: &str| task_of.get(readable).map(|t| t.external_id);

        let mut new_matches = Vec::with_capacity(downstream.len());
        for task in &downstream {
            let step = version
                .step(task.step_id)
                .ok_or(EngineError::UnknownStep(task.step_id))?;
            let mut conditions = if step.job_kind == JobKind::OnFailure {
                let siblings: Vec<(&str, Uuid)> = on_failure_siblings(version)
                    .into_iter()
                    .filter_map(|id| Some((id, external_id(id)?)))
                    .collect();
                on_failure_conditions(&siblings)
            } else {
                let parents: Vec<(&str, Uuid)> = step
                    .parents
                    .iter()
                    .filter_map(|p| Some((p.as_str(), external_id(p)?)))
                    .collect();
                fan_in_conditions(step, &parents)
            };
            presatisfy_outside_parents(&self.evaluator, &mut conditions, &subtree, &history);

            new_matches.push(NewMatch {
                target: MatchTarget::Trigger(Box::new(TriggerTarget {
                    dag: dag.map(Dag::dag_ref),
                    workflow_id: task.workflow_id,
                    workflow_version_id: task.workflow_version_id,
                    step_id: task.step_id,
                    step_readable_id: task.step_readable_id.clone(),
                    external_id: task.external_id,
                    workflow_run_id: task.workflow_run_id,
                    priority: Some(task.priority),
                    additional_metadata: task.additional_metadata.clone(),
                    parent: task.parent.clone(),
                    existing_task: Some(task.key()),
                    input: TaskInput::new(run_input.clone()),
                })),
                conditions,
            });
        }

        let inserted = self
            .gateway
            .insert_matches(&mut ctx.tx, ctx.tenant, &new_matches)
            .await?;
        result.deferred.extend(downstream_keys);
        let ids: Vec<i64> = inserted.iter().map(|m| m.id).collect();
        self.fire_ready_matches(ctx, &ids).await
    }
}
