//! Replay & finalization rules that do not touch storage.
//!
//! A run is only replayable or reportable once it is finalized: every task is
//! terminal and, for DAGs, there is one task per step.

pub mod finalize;

use std::collections::{HashMap, HashSet};

use tasklane_types::event::TaskEvent;
use tasklane_types::matching::{MatchEventType, NewMatchCondition};
use tasklane_types::task::Task;
use tasklane_types::workflow::{JobKind, WorkflowVersion};
use serde_json::Value;

use crate::expression::CachedEvaluator;
use crate::graph::StepGraph;
use crate::matching::conditions::{condition_scope, expression_holds};

pub use finalize::run_status;

/// All tasks of a run are terminal and there are as many as it has steps.
pub fn preflight(tasks: &[&Task], step_count: usize) -> bool {
    !tasks.is_empty() && tasks.len() == step_count && tasks.iter().all(|t| t.status.is_terminal())
}

/// Readable ids a replay of `requested` touches: the requested steps, their
/// descendants and the run's on-failure step.
pub fn replay_subtree<'a>(
    version: &'a WorkflowVersion,
    graph: &StepGraph<'a>,
    requested: &[&str],
) -> HashSet<&'a str> {
    let mut subtree = graph.descendants(requested);
    if let Some(on_failure) = version.on_failure_step() {
        subtree.insert(on_failure.readable_id.as_str());
    }
    subtree
}

/// The terminal event a parent left behind, with its data.
#[derive(Debug, Clone)]
pub struct HistoricalOutcome {
    pub event: TaskEvent,
    pub data: Value,
}

/// Pre-satisfy conditions that wait on parents outside the replayed subtree,
/// using each parent's terminal event from before the replay. Conditions on
/// parents inside the subtree stay open.
pub fn presatisfy_outside_parents(
    evaluator: &CachedEvaluator,
    conditions: &mut [NewMatchCondition],
    subtree: &HashSet<&str>,
    history: &HashMap<&str, HistoricalOutcome>,
) {
    for condition in conditions.iter_mut() {
        if condition.event_type != MatchEventType::Internal
            || subtree.contains(condition.readable_data_key.as_str())
        {
            continue;
        }
        let Some(outcome) = history.get(condition.readable_data_key.as_str()) else {
            continue;
        };
        if outcome.event.event_type.as_str() != condition.event_key {
            continue;
        }
        let scope = condition_scope(&outcome.data, &outcome.data);
        if expression_holds(evaluator, &condition.expression, &scope, None) {
            condition.satisfied_data = Some(outcome.data.clone());
        }
    }
}

/// Siblings an on-failure step watches: every other step of the version.
pub fn on_failure_siblings(version: &WorkflowVersion) -> Vec<&str> {
    version
        .sorted_steps()
        .into_iter()
        .filter(|s| s.job_kind != JobKind::OnFailure)
        .map(|s| s.readable_id.as_str())
        .collect()
}
