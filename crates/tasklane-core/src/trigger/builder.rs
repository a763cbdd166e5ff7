//! Match conditions generated from step definitions.
//!
//! Parent steps are waited on through internal events hinted with the parent
//! task's external id, so a condition only ever sees its own parent's events.

use serde_json::Value;
use tasklane_types::event::TaskEventType;
use tasklane_types::matching::{MatchAction, MatchEventType, NewMatchCondition};
use tasklane_types::task::sleep_event_key;
use tasklane_types::workflow::{StepCondition, StepConditionKind, StepDefinition};
use uuid::Uuid;

pub const SKIPPED_EXPRESSION: &str = "output.skipped == true";

/// Deterministic external id of a DAG step's task.
pub fn dag_task_external_id(dag_external_id: Uuid, readable_id: &str) -> Uuid {
    Uuid::new_v5(&dag_external_id, readable_id.as_bytes())
}

/// Marker stored as the output of a skipped task.
pub fn skipped_output() -> Value {
    serde_json::json!({ "skipped": true })
}

fn internal(
    group_id: Uuid,
    event_type: TaskEventType,
    hint: Uuid,
    expression: &str,
    action: MatchAction,
    readable_data_key: &str,
) -> NewMatchCondition {
    NewMatchCondition {
        group_id,
        event_type: MatchEventType::Internal,
        event_key: event_type.as_str().to_string(),
        event_resource_hint: Some(hint.to_string()),
        expression: expression.to_string(),
        action,
        readable_data_key: readable_data_key.to_string(),
        satisfied_data: None,
    }
}

/// Default fan-in groups for one parent of `step`: complete, skip and cancel.
///
/// A `PARENT_OVERRIDE` on the step replaces the complete group's expression
/// and action. Steps with extra conditions complete into `CREATE_MATCH` so
/// their additional match is created once the parents are done.
pub fn parent_conditions(
    step: &StepDefinition,
    parent_readable_id: &str,
    parent_external_id: Uuid,
) -> Vec<NewMatchCondition> {
    let default_action = if step.has_extra_conditions() {
        MatchAction::CreateMatch
    } else {
        MatchAction::Queue
    };
    let (expression, action) = match step.parent_override(parent_readable_id) {
        Some(over) => (over.expression.as_str(), over.action),
        None => ("true", default_action),
    };

    let cancel_group = Uuid::now_v7();
    vec![
        internal(
            Uuid::now_v7(),
            TaskEventType::Completed,
            parent_external_id,
            expression,
            action,
            parent_readable_id,
        ),
        internal(
            Uuid::now_v7(),
            TaskEventType::Completed,
            parent_external_id,
            SKIPPED_EXPRESSION,
            MatchAction::Skip,
            parent_readable_id,
        ),
        internal(
            cancel_group,
            TaskEventType::Failed,
            parent_external_id,
            "true",
            MatchAction::Cancel,
            parent_readable_id,
        ),
        internal(
            cancel_group,
            TaskEventType::Cancelled,
            parent_external_id,
            "true",
            MatchAction::Cancel,
            parent_readable_id,
        ),
    ]
}

/// Fan-in over every parent. `parents` pairs readable ids with task external
/// ids.
pub fn fan_in_conditions(step: &StepDefinition, parents: &[(&str, Uuid)]) -> Vec<NewMatchCondition> {
    parents
        .iter()
        .flat_map(|(readable_id, external_id)| parent_conditions(step, readable_id, *external_id))
        .collect()
}

/// Conditions of an on-failure step: one queue group with a `FAILED`
/// condition per sibling, and one skip group per sibling that fires when the
/// sibling completed or was cancelled. The step runs when anything failed and
/// is skipped when nothing did.
pub fn on_failure_conditions(siblings: &[(&str, Uuid)]) -> Vec<NewMatchCondition> {
    let queue_group = Uuid::now_v7();
    let mut conditions: Vec<NewMatchCondition> = siblings
        .iter()
        .map(|(readable_id, external_id)| {
            internal(
                queue_group,
                TaskEventType::Failed,
                *external_id,
                "true",
                MatchAction::Queue,
                readable_id,
            )
        })
        .collect();

    for (readable_id, external_id) in siblings {
        let skip_group = Uuid::now_v7();
        conditions.push(internal(
            skip_group,
            TaskEventType::Completed,
            *external_id,
            "true",
            MatchAction::Skip,
            readable_id,
        ));
        conditions.push(internal(
            skip_group,
            TaskEventType::Cancelled,
            *external_id,
            "true",
            MatchAction::Skip,
            readable_id,
        ));
    }
    conditions
}

/// Durations of the sleep conditions among `conditions`, in order.
pub fn sleep_durations<'a>(conditions: impl IntoIterator<Item = &'a StepCondition>) -> Vec<i64> {
    conditions
        .into_iter()
        .filter_map(|c| match c.kind {
            StepConditionKind::Sleep { sleep_for_secs } => Some(sleep_for_secs),
            _ => None,
        })
        .collect()
}

/// Match conditions for sleep and user-event conditions. `sleep_ids` are the
/// durable sleeps registered for the sleep conditions, in order. Parent
/// overrides are not waits and are skipped.
pub fn wait_conditions<'a>(
    conditions: impl IntoIterator<Item = &'a StepCondition>,
    sleep_ids: &[i64],
) -> Vec<NewMatchCondition> {
    let mut sleeps = sleep_ids.iter();
    conditions
        .into_iter()
        .filter_map(|condition| {
            let (event_type, event_key) = match &condition.kind {
                StepConditionKind::Sleep { .. } => {
                    (MatchEventType::Internal, sleep_event_key(*sleeps.next()?))
                }
                StepConditionKind::UserEvent { event_key } => (MatchEventType::User, event_key.clone()),
                StepConditionKind::ParentOverride { .. } => return None,
            };
            Some(NewMatchCondition {
                group_id: condition.or_group_id,
                event_type,
                event_key,
                event_resource_hint: None,
                expression: condition.expression.clone(),
                action: condition.action,
                readable_data_key: condition.readable_data_key.clone(),
                satisfied_data: None,
            })
        })
        .collect()
}

/// The step's own sleep and user-event conditions.
pub fn extra_conditions(step: &StepDefinition, sleep_ids: &[i64]) -> Vec<NewMatchCondition> {
    wait_conditions(step.extra_conditions(), sleep_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, parents: &[&str]) -> StepDefinition {
        let mut s = StepDefinition::new(id, format!("do:{id}"));
        s.parents = parents.iter().map(|p| p.to_string()).collect();
        s
    }

    #[test]
    fn test_dag_task_ids_are_deterministic() {
        let dag = Uuid::now_v7();
        assert_eq!(dag_task_external_id(dag, "a"), dag_task_external_id(dag, "a"));
        assert_ne!(dag_task_external_id(dag, "a"), dag_task_external_id(dag, "b"));
    }

    #[test]
    fn test_parent_conditions_default_groups() {
        let child = step("b", &["a"]);
        let parent_id = Uuid::now_v7();
        let conditions = parent_conditions(&child, "a", parent_id);
        assert_eq!(conditions.len(), 4);

        let hint = parent_id.to_string();
        assert!(conditions.iter().all(|c| c.event_resource_hint.as_deref() == Some(hint.as_str())));
        assert!(conditions.iter().all(|c| c.readable_data_key == "a"));

        assert_eq!(conditions[0].action, MatchAction::Queue);
        assert_eq!(conditions[0].expression, "true");
        assert_eq!(conditions[1].action, MatchAction::Skip);
        assert_eq!(conditions[1].expression, SKIPPED_EXPRESSION);
        assert_eq!(conditions[2].action, MatchAction::Cancel);
        assert_eq!(conditions[2].group_id, conditions[3].group_id);
        assert_eq!(conditions[2].event_key, "FAILED");
        assert_eq!(conditions[3].event_key, "CANCELLED");
    }

    #[test]
    fn test_parent_override_replaces_complete_group_only() {
        let mut child = step("b", &["a", "c"]);
        child.conditions.push(StepCondition {
            or_group_id: Uuid::now_v7(),
            readable_data_key: "a".into(),
            action: MatchAction::Skip,
            expression: "output.value < 10".into(),
            kind: StepConditionKind::ParentOverride {
                parent_readable_id: "a".into(),
            },
        });

        let from_a = parent_conditions(&child, "a", Uuid::now_v7());
        assert_eq!(from_a[0].action, MatchAction::Skip);
        assert_eq!(from_a[0].expression, "output.value < 10");
        assert_eq!(from_a[2].action, MatchAction::Cancel);

        let from_c = parent_conditions(&child, "c", Uuid::now_v7());
        assert_eq!(from_c[0].action, MatchAction::Queue);
        assert_eq!(from_c[0].expression, "true");
    }

    #[test]
    fn test_extra_conditions_switch_parents_to_create_match() {
        let mut child = step("b", &["a"]);
        child.conditions.push(StepCondition {
            or_group_id: Uuid::now_v7(),
            readable_data_key: "nap".into(),
            action: MatchAction::Queue,
            expression: "true".into(),
            kind: StepConditionKind::Sleep { sleep_for_secs: 30 },
        });
        let conditions = fan_in_conditions(&child, &[("a", Uuid::now_v7())]);
        assert_eq!(conditions[0].action, MatchAction::CreateMatch);
    }

    #[test]
    fn test_on_failure_groups() {
        let siblings = [("a", Uuid::now_v7()), ("b", Uuid::now_v7())];
        let conditions = on_failure_conditions(&siblings);
        assert_eq!(conditions.len(), 6);

        let queue: Vec<_> = conditions.iter().filter(|c| c.action == MatchAction::Queue).collect();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].group_id, queue[1].group_id);
        assert!(queue.iter().all(|c| c.event_key == "FAILED"));

        let skip: Vec<_> = conditions.iter().filter(|c| c.action == MatchAction::Skip).collect();
        assert_eq!(skip.len(), 4);
        assert_eq!(skip[0].group_id, skip[1].group_id);
        assert_ne!(skip[1].group_id, skip[2].group_id);
    }

    #[test]
    fn test_extra_conditions_use_sleep_ids_and_event_keys() {
        let group = Uuid::now_v7();
        let mut s = step("a", &[]);
        s.conditions.push(StepCondition {
            or_group_id: group,
            readable_data_key: "nap".into(),
            action: MatchAction::Queue,
            expression: "true".into(),
            kind: StepConditionKind::Sleep { sleep_for_secs: 30 },
        });
        s.conditions.push(StepCondition {
            or_group_id: group,
            readable_data_key: "paid".into(),
            action: MatchAction::Queue,
            expression: "input.amount > 0".into(),
            kind: StepConditionKind::UserEvent {
                event_key: "order:paid".into(),
            },
        });
        assert_eq!(sleep_durations(s.extra_conditions()), vec![30]);

        let conditions = extra_conditions(&s, &[42]);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].event_key, "sleep-42");
        assert_eq!(conditions[0].event_type, MatchEventType::Internal);
        assert_eq!(conditions[1].event_key, "order:paid");
        assert_eq!(conditions[1].event_type, MatchEventType::User);
        assert!(conditions.iter().all(|c| c.group_id == group && c.event_resource_hint.is_none()));
    }
}
