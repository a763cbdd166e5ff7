//! Deciding what a match does once enough of its conditions are satisfied.
//!
//! Groups are keyed by `(action, group_id)`; a group is satisfied when any of
//! its conditions is. Cancel fires on any satisfied group, every other action
//! needs all of its groups. The highest-precedence satisfied action wins.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tasklane_types::event::TaskEventType;
use tasklane_types::matching::{GroupMatchCondition, MatchAction, MatchDecision, MatchEventType};
use uuid::Uuid;

pub fn satisfied_actions(conditions: &[GroupMatchCondition]) -> Vec<MatchAction> {
    let mut groups: BTreeMap<MatchAction, BTreeMap<Uuid, bool>> = BTreeMap::new();
    for condition in conditions {
        let group = groups
            .entry(condition.action)
            .or_default()
            .entry(condition.group_id)
            .or_insert(false);
        *group |= condition.is_satisfied;
    }

    MatchAction::BY_PRECEDENCE
        .into_iter()
        .filter(|action| match groups.get(action) {
            Some(groups) if action.requires_all_groups() => groups.values().all(|s| *s),
            Some(groups) => groups.values().any(|s| *s),
            None => false,
        })
        .collect()
}

fn is_parent_completion(condition: &GroupMatchCondition) -> bool {
    condition.event_type == MatchEventType::Internal
        && condition.event_key == TaskEventType::Completed.as_str()
        && condition.event_resource_hint.is_some()
}

/// Resolve a match. `None` means it stays pending.
pub fn resolve_match(conditions: &[GroupMatchCondition]) -> Option<MatchDecision> {
    let action = satisfied_actions(conditions).into_iter().next()?;

    let mut satisfied: Vec<&GroupMatchCondition> =
        conditions.iter().filter(|c| c.is_satisfied).collect();
    satisfied.sort_by_key(|c| c.id);

    let mut aggregated: Map<String, Value> = Map::new();
    let mut parent_outputs = BTreeMap::new();
    let mut trigger_data: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for condition in satisfied {
        let data = condition.data.clone().unwrap_or(Value::Null);

        let per_action = aggregated
            .entry(condition.action.as_str().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(keys) = per_action {
            let slot = keys
                .entry(condition.readable_data_key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(values) = slot {
                values.push(data.clone());
            }
        }

        if condition.action != action {
            continue;
        }
        if is_parent_completion(condition) {
            parent_outputs.insert(condition.readable_data_key.clone(), data);
        } else {
            trigger_data
                .entry(condition.readable_data_key.clone())
                .or_default()
                .push(data);
        }
    }

    Some(MatchDecision {
        action,
        aggregated_data: Value::Object(aggregated),
        parent_outputs,
        trigger_data,
    })
}
