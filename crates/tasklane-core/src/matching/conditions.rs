//! Candidate-event routing and condition evaluation.
//!
//! Hinted events only reach conditions with the same hint or no hint;
//! hintless events only reach hintless conditions. Evaluation failures are
//! logged and treated as "not satisfied".

use std::collections::HashSet;

use serde_json::{json, Value};
use tasklane_types::event::CandidateEvent;
use tasklane_types::matching::{GroupMatchCondition, MatchEventType};

use crate::expression::CachedEvaluator;
use crate::repository::matching::{ConditionLookup, SatisfiedCondition};

/// Drop hintless events whose `(kind, key)` was already seen in the batch.
pub fn dedupe_hintless(events: Vec<CandidateEvent>) -> Vec<CandidateEvent> {
    let mut seen: HashSet<(MatchEventType, String)> = HashSet::new();
    events
        .into_iter()
        .filter(|event| {
            event.resource_hint.is_some() || seen.insert((event.kind, event.key.clone()))
        })
        .collect()
}

/// Distinct storage lookups for a batch of events.
pub fn lookups(events: &[CandidateEvent]) -> Vec<ConditionLookup> {
    let mut seen = HashSet::new();
    events
        .iter()
        .map(|event| ConditionLookup {
            event_type: event.kind,
            event_key: event.key.clone(),
            resource_hint: event.resource_hint.clone(),
        })
        .filter(|lookup| seen.insert(lookup.clone()))
        .collect()
}

pub fn event_applies(condition: &GroupMatchCondition, event: &CandidateEvent) -> bool {
    if condition.event_type != event.kind || condition.event_key != event.key {
        return false;
    }
    match (&condition.event_resource_hint, &event.resource_hint) {
        (None, _) => true,
        (Some(wanted), Some(got)) => wanted == got,
        (Some(_), None) => false,
    }
}

/// Context object bound when evaluating a condition against an event.
pub fn condition_scope(data: &Value, output: &Value) -> Value {
    json!({ "input": data, "output": output })
}

/// Evaluate one condition expression, logging and rejecting on error.
pub fn expression_holds(
    evaluator: &CachedEvaluator,
    expression: &str,
    scope: &Value,
    condition_id: Option<i64>,
) -> bool {
    match evaluator.evaluate_bool(expression, scope) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(
                condition_id = ?condition_id,
                expression,
                error = %err,
                "condition expression failed, treating as not satisfied"
            );
            false
        }
    }
}

/// Conditions satisfied by the batch. Each condition takes the data of the
/// first applicable event whose expression holds.
pub fn evaluate_conditions(
    evaluator: &CachedEvaluator,
    conditions: &[GroupMatchCondition],
    events: &[CandidateEvent],
) -> Vec<SatisfiedCondition> {
    conditions
        .iter()
        .filter_map(|condition| {
            events
                .iter()
                .filter(|event| event_applies(condition, event))
                .find(|event| {
                    let scope = condition_scope(&event.data, event.output_scope());
                    expression_holds(evaluator, &condition.expression, &scope, Some(condition.id))
                })
                .map(|event| SatisfiedCondition {
                    id: condition.id,
                    data: event.data.clone(),
                })
        })
        .collect()
}
