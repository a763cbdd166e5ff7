//! Finalization check for workflow runs.

use std::collections::{HashMap, HashSet};

use tasklane_types::dag::FinalizedRun;
use tasklane_types::event::TaskEventType;
use tasklane_types::payload::{PayloadKey, PayloadType};
use tasklane_types::task::{Task, TaskIdInsertedAt, TenantId};
use uuid::Uuid;

use super::{EngineError, TaskEngine};
use crate::replay::{preflight, run_status};
use crate::repository::Gateway;

impl<G: Gateway> TaskEngine<G> {
    /// Runs among `run_ids` that are finalized, with their status and step
    /// outputs. Unfinished and unknown runs are left out.
    #[tracing::instrument(skip(self, run_ids), fields(tenant_id = %tenant, count = run_ids.len()))]
    pub async fn list_finalized_workflow_runs(
        &self,
        tenant: TenantId,
        run_ids: &[Uuid],
    ) -> Result<Vec<FinalizedRun>, EngineError> {
        let mut tx = self.gateway.begin().await?;
        let result = self.finalized_runs(&mut tx, tenant, run_ids).await;
        self.gateway.rollback(tx).await?;
        result
    }

    pub(crate) async fn finalized_runs(
        &self,
        tx: &mut G::Tx,
        tenant: TenantId,
        run_ids: &[Uuid],
    ) -> Result<Vec<FinalizedRun>, EngineError> {
        let tasks = self.gateway.list_tasks_for_runs(tx, tenant, run_ids).await?;
        let step_counts: HashMap<Uuid, usize> = self
            .gateway
            .get_dags_by_external_ids(tx, tenant, run_ids)
            .await?
            .into_iter()
            .map(|dag| (dag.external_id, dag.total_tasks.max(0) as usize))
            .collect();

        let mut by_run: HashMap<Uuid, Vec<&Task>> = HashMap::new();
        for task in &tasks {
            by_run.entry(task.workflow_run_id).or_default().push(task);
        }

        let mut seen = HashSet::new();
        let passing: Vec<(Uuid, usize, &Vec<&Task>)> = run_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| {
                let run_tasks = by_run.get(id)?;
                let step_count = step_counts.get(id).copied().unwrap_or(1);
                preflight(run_tasks, step_count).then_some((*id, step_count, run_tasks))
            })
            .collect();
        if passing.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<TaskIdInsertedAt> = passing
            .iter()
            .flat_map(|(_, _, run_tasks)| run_tasks.iter().map(|t| t.key()))
            .collect();
        let events = self
            .gateway
            .list_current_terminal_events(tx, tenant, &keys)
            .await?;
        let payload_keys: Vec<PayloadKey> = events
            .iter()
            .filter(|e| e.event_type == TaskEventType::Completed)
            .map(|e| PayloadKey::new(e.id, e.inserted_at, PayloadType::TaskEventData))
            .collect();
        let mut payloads = self
            .gateway
            .retrieve_payloads(tx, tenant, &payload_keys)
            .await?;

        let mut finalized = Vec::new();
        for (run_id, step_count, run_tasks) in passing {
            let readable: HashMap<TaskIdInsertedAt, &str> = run_tasks
                .iter()
                .map(|t| (t.key(), t.step_readable_id.as_str()))
                .collect();
            let run_events: Vec<_> = events
                .iter()
                .filter(|e| readable.contains_key(&e.task_key()))
                .collect();
            let distinct: HashSet<i64> = run_events.iter().map(|e| e.task_id).collect();
            if distinct.len() != step_count {
                tracing::debug!(run_id = %run_id, "run has tasks without a current terminal event");
                continue;
            }

            let mut outputs = std::collections::BTreeMap::new();
            for event in &run_events {
                if event.event_type != TaskEventType::Completed {
                    continue;
                }
                let key = PayloadKey::new(event.id, event.inserted_at, PayloadType::TaskEventData);
                if let (Some(step), Some(data)) = (readable.get(&event.task_key()), payloads.remove(&key)) {
                    outputs.insert(step.to_string(), data);
                }
            }
            finalized.push(FinalizedRun {
                external_id: run_id,
                status: run_status(run_events.iter().map(|e| &e.event_type)),
                outputs,
            });
        }
        Ok(finalized)
    }
}
