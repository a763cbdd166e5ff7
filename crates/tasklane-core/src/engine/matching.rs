//! Persisting condition satisfaction and applying fired matches.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tasklane_types::event::{CandidateEvent, NewTaskEvent, TaskEventType};
use tasklane_types::matching::{
    Match, MatchAction, MatchDecision, MatchTarget, NewMatch, SignalTarget, TriggerTarget,
};
use tasklane_types::task::{TaskInitialState, TaskInput};

use super::create::{CreateTaskOpts, ReplayTaskOpts};
use super::{EngineError, TaskEngine, TxContext};
use crate::matching::{dedupe_hintless, evaluate_conditions, lookups, resolve_match};
use crate::repository::matching::ClosedMatch;
use crate::repository::Gateway;
use crate::trigger::builder::{extra_conditions, sleep_durations};

pub const CANCELLED_BY_PARENT: &str = "a parent step failed or was cancelled";

fn merged_input(target: &TriggerTarget, decision: &MatchDecision) -> TaskInput {
    let mut input = target.input.clone();
    input.parents.extend(decision.parent_outputs.clone());
    for (key, values) in &decision.trigger_data {
        input
            .triggers
            .entry(key.clone())
            .or_default()
            .extend(values.iter().cloned());
    }
    input
}

fn initial_state(action: MatchAction) -> (TaskInitialState, Option<String>) {
    match action {
        MatchAction::Cancel => (
            TaskInitialState::Cancelled,
            Some(CANCELLED_BY_PARENT.to_string()),
        ),
        MatchAction::Skip => (TaskInitialState::Skipped, None),
        MatchAction::Queue | MatchAction::Create | MatchAction::CreateMatch => {
            (TaskInitialState::Queued, None)
        }
    }
}

#[derive(Default)]
struct FiredEffects {
    creates: Vec<CreateTaskOpts>,
    replays: Vec<ReplayTaskOpts>,
    expansions: Vec<TriggerTarget>,
    signals: Vec<(SignalTarget, Value)>,
}

impl FiredEffects {
    fn add(&mut self, fired: Match, decision: MatchDecision) {
        match fired.target {
            MatchTarget::Trigger(target) => {
                let mut target = *target;
                let input = merged_input(&target, &decision);
                if decision.action == MatchAction::CreateMatch {
                    target.input = input;
                    self.expansions.push(target);
                    return;
                }
                let (state, reason) = initial_state(decision.action);
                match target.existing_task {
                    Some(task) => self.replays.push(ReplayTaskOpts {
                        task,
                        input: Some(input),
                        initial_state: state,
                        initial_state_reason: reason,
                    }),
                    None => self.creates.push(CreateTaskOpts {
                        external_id: target.external_id,
                        workflow_run_id: target.workflow_run_id,
                        workflow_version_id: target.workflow_version_id,
                        step_id: target.step_id,
                        dag: target.dag,
                        input,
                        initial_state: state,
                        initial_state_reason: reason,
                        priority: target.priority,
                        additional_metadata: target.additional_metadata,
                        parent: target.parent,
                    }),
                }
            }
            MatchTarget::Signal(target) => {
                let data = decision
                    .aggregated_data
                    .get(decision.action.as_str())
                    .cloned()
                    .unwrap_or(Value::Null);
                self.signals.push((target, data));
            }
        }
    }
}

impl<G: Gateway> TaskEngine<G> {
    /// Route one batch of candidate events to waiting conditions and fire
    /// whatever became satisfied.
    pub(crate) async fn process_candidates(
        &self,
        ctx: &mut TxContext<G::Tx>,
        events: Vec<CandidateEvent>,
    ) -> Result<(), EngineError> {
        let events = dedupe_hintless(events);
        let lookups = lookups(&events);
        if lookups.is_empty() {
            return Ok(());
        }
        let conditions = self
            .gateway
            .list_candidate_conditions(&mut ctx.tx, ctx.tenant, &lookups)
            .await?;
        if conditions.is_empty() {
            return Ok(());
        }

        let satisfied = evaluate_conditions(&self.evaluator, &conditions, &events);
        if satisfied.is_empty() {
            return Ok(());
        }
        self.gateway
            .satisfy_conditions(&mut ctx.tx, ctx.tenant, &satisfied)
            .await?;

        let match_of: HashMap<i64, i64> = conditions.iter().map(|c| (c.id, c.match_id)).collect();
        let match_ids: BTreeSet<i64> = satisfied
            .iter()
            .filter_map(|s| match_of.get(&s.id).copied())
            .collect();
        tracing::debug!(
            events = events.len(),
            satisfied = satisfied.len(),
            matches = match_ids.len(),
            "conditions satisfied"
        );
        let match_ids: Vec<i64> = match_ids.into_iter().collect();
        self.fire_ready_matches(ctx, &match_ids).await
    }

    /// Close every match in `ids` whose conditions resolve to an action and
    /// apply its effect. The close is guarded, so a match fires at most once.
    pub(crate) async fn fire_ready_matches(
        &self,
        ctx: &mut TxContext<G::Tx>,
        ids: &[i64],
    ) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let matches = self.gateway.get_matches(&mut ctx.tx, ctx.tenant, ids).await?;

        let mut decided: Vec<(Match, MatchDecision)> = matches
            .into_iter()
            .filter(|m| !m.is_satisfied)
            .filter_map(|m| {
                let decision = resolve_match(&m.conditions)?;
                Some((m, decision))
            })
            .collect();
        if decided.is_empty() {
            return Ok(());
        }

        let closing: Vec<ClosedMatch> = decided
            .iter()
            .map(|(m, decision)| ClosedMatch {
                id: m.id,
                aggregated_data: decision.aggregated_data.clone(),
            })
            .collect();
        let closed = self
            .gateway
            .close_matches(&mut ctx.tx, ctx.tenant, &closing)
            .await?;
        decided.retain(|(m, _)| closed.contains(&m.id));

        let mut effects = FiredEffects::default();
        for (fired, decision) in decided {
            tracing::debug!(
                match_id = fired.id,
                kind = %fired.kind,
                action = %decision.action,
                "match fired"
            );
            effects.add(fired, decision);
        }

        self.create_tasks_in(ctx, effects.creates).await?;
        self.replay_in_place(ctx, effects.replays).await?;
        self.expand_matches(ctx, effects.expansions).await?;
        self.complete_signals(ctx, effects.signals).await?;
        Ok(())
    }

    /// `CREATE_MATCH`: the parents are done, now wait on the step's own
    /// sleep and user-event conditions.
    async fn expand_matches(
        &self,
        ctx: &mut TxContext<G::Tx>,
        targets: Vec<TriggerTarget>,
    ) -> Result<(), EngineError> {
        let mut new_matches = Vec::with_capacity(targets.len());
        for target in targets {
            let version = self.load_version(ctx, target.workflow_version_id).await?;
            let step = version
                .step(target.step_id)
                .ok_or(EngineError::UnknownStep(target.step_id))?;
            let durations = sleep_durations(step.extra_conditions());
            let sleeps = self
                .gateway
                .insert_durable_sleeps(&mut ctx.tx, ctx.tenant, &durations)
                .await?;
            let sleep_ids: Vec<i64> = sleeps.iter().map(|s| s.id).collect();
            new_matches.push(NewMatch {
                conditions: extra_conditions(step, &sleep_ids),
                target: MatchTarget::Trigger(Box::new(target)),
            });
        }
        if !new_matches.is_empty() {
            self.gateway
                .insert_matches(&mut ctx.tx, ctx.tenant, &new_matches)
                .await?;
        }
        Ok(())
    }

    /// Write `SIGNAL_COMPLETED` on the waiting attempts. A signal registered
    /// by an attempt that is no longer current is dropped.
    async fn complete_signals(
        &self,
        ctx: &mut TxContext<G::Tx>,
        signals: Vec<(SignalTarget, Value)>,
    ) -> Result<(), EngineError> {
        if signals.is_empty() {
            return Ok(());
        }
        let keys: Vec<_> = signals.iter().map(|(s, _)| s.task.key()).collect();
        let tasks = self.gateway.get_tasks(&mut ctx.tx, ctx.tenant, &keys).await?;

        let events = signals
            .into_iter()
            .filter_map(|(signal, data)| {
                let Some(task) = tasks.iter().find(|t| t.key() == signal.task.key()) else {
                    tracing::warn!(task_id = signal.task.id, "signalled task no longer exists");
                    return None;
                };
                if task.retry_count != signal.task.retry_count || task.status.is_terminal() {
                    tracing::debug!(
                        task_id = signal.task.id,
                        retry_count = signal.task.retry_count,
                        "signal for a retired attempt dropped"
                    );
                    return None;
                }
                Some(NewTaskEvent {
                    task: task.attempt(),
                    task_external_id: signal.external_id,
                    event_type: TaskEventType::SignalCompleted,
                    event_key: Some(signal.signal_key),
                    data,
                    is_current_retry: true,
                })
            })
            .collect();
        self.write_events(ctx, events).await?;
        Ok(())
    }
}
