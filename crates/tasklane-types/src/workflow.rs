//! Workflow definition types.
//!
//! A `WorkflowVersion` is the immutable shape of a workflow: its steps, their
//! parents, retry settings and the extra conditions a step waits on before it
//! may run. Versions are loaded by the trigger builder and by replay.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseEnumError;
use crate::matching::MatchAction;
use crate::task::RetryPolicy;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: i32 = 1;
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Workflow version
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowVersion {
    pub fn step(&self, step_id: Uuid) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_by_readable_id(&self, readable_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.readable_id == readable_id)
    }

    pub fn on_failure_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.job_kind == JobKind::OnFailure)
    }

    /// Steps in lexical step-id order, the order the builder walks them in.
    pub fn sorted_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.id);
        steps
    }

    /// Runs of more than one step get a DAG row.
    pub fn is_dag(&self) -> bool {
        self.steps.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    #[default]
    Default,
    OnFailure,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Default => "DEFAULT",
            JobKind::OnFailure => "ON_FAILURE",
        })
    }
}

impl FromStr for JobKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEFAULT" => Ok(JobKind::Default),
            "ON_FAILURE" => Ok(JobKind::OnFailure),
            other => Err(ParseEnumError::new("job kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyStrategy {
    #[default]
    GroupRoundRobin,
    CancelInProgress,
    CancelNewest,
}

/// A concurrency rule. The expression yields the concurrency key string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyRule {
    pub expression: String,
    pub max_runs: i32,
    #[serde(default)]
    pub strategy: ConcurrencyStrategy,
}

/// A named expression evaluated at task creation, value kept on the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExpression {
    pub key: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepConditionKind {
    /// Durable sleep; the condition fires once the sleep expires.
    Sleep { sleep_for_secs: i64 },
    /// Waits on a user event with this key.
    UserEvent { event_key: String },
    /// Replaces the default completion rule for one parent.
    ParentOverride { parent_readable_id: String },
}

/// An extra condition a step waits on before it may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    pub or_group_id: Uuid,
    pub readable_data_key: String,
    pub action: MatchAction,
    #[serde(default = "default_condition_expression")]
    pub expression: String,
    #[serde(flatten)]
    pub kind: StepConditionKind,
}

fn default_condition_expression() -> String {
    "true".to_string()
}

impl StepCondition {
    pub fn is_parent_override(&self) -> bool {
        matches!(self.kind, StepConditionKind::ParentOverride { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: Uuid,
    pub readable_id: String,
    pub action_id: String,
    #[serde(default)]
    pub job_kind: JobKind,
    /// Readable ids of the parent steps.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub retries: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_backoff_secs: Option<i64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub concurrency: Vec<ConcurrencyRule>,
    #[serde(default)]
    pub expressions: Vec<StepExpression>,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
}

fn default_timeout_secs() -> i64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl StepDefinition {
    /// A step with the given ids and every optional setting at its default.
    pub fn new(readable_id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            readable_id: readable_id.into(),
            action_id: action_id.into(),
            job_kind: JobKind::Default,
            parents: Vec::new(),
            retries: 0,
            retry_backoff_factor: None,
            retry_max_backoff_secs: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            priority: None,
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: Vec::new(),
            expressions: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries,
            backoff_factor: self.retry_backoff_factor,
            max_backoff_secs: self.retry_max_backoff_secs,
        }
    }

    /// Sleep and user-event conditions; parent overrides are not included.
    pub fn extra_conditions(&self) -> impl Iterator<Item = &StepCondition> {
        self.conditions.iter().filter(|c| !c.is_parent_override())
    }

    pub fn has_extra_conditions(&self) -> bool {
        self.extra_conditions().next().is_some()
    }

    pub fn parent_override(&self, parent_readable_id: &str) -> Option<&StepCondition> {
        self.conditions.iter().find(|c| match &c.kind {
            StepConditionKind::ParentOverride { parent_readable_id: p } => p == parent_readable_id,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(kind: StepConditionKind) -> StepCondition {
        StepCondition {
            or_group_id: Uuid::now_v7(),
            readable_data_key: "k".into(),
            action: MatchAction::Queue,
            expression: "true".into(),
            kind,
        }
    }

    #[test]
    fn test_step_defaults_from_minimal_json() {
        let json = format!(
            r#"{{"id": "{}", "readable_id": "a", "action_id": "do:a"}}"#,
            Uuid::now_v7()
        );
        let step: StepDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(step.queue, DEFAULT_QUEUE);
        assert_eq!(step.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(step.job_kind, JobKind::Default);
        assert!(step.parents.is_empty());
    }

    #[test]
    fn test_extra_conditions_exclude_parent_overrides() {
        let mut step = StepDefinition::new("b", "do:b");
        step.conditions.push(condition(StepConditionKind::ParentOverride {
            parent_readable_id: "a".into(),
        }));
        assert!(!step.has_extra_conditions());
        assert!(step.parent_override("a").is_some());
        assert!(step.parent_override("c").is_none());

        step.conditions
            .push(condition(StepConditionKind::Sleep { sleep_for_secs: 5 }));
        assert_eq!(step.extra_conditions().count(), 1);
    }

    #[test]
    fn test_condition_kind_is_flattened() {
        let cond = condition(StepConditionKind::UserEvent {
            event_key: "order:paid".into(),
        });
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["kind"], "USER_EVENT");
        assert_eq!(json["event_key"], "order:paid");
        let back: StepCondition = serde_json::from_value(json).unwrap();
        assert_eq!(back, cond);
    }

    #[test]
    fn test_sorted_steps_orders_by_id() {
        let a = StepDefinition::new("a", "do:a");
        let b = StepDefinition::new("b", "do:b");
        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "wf".into(),
            steps: vec![b.clone(), a.clone()],
        };
        let sorted: Vec<&str> = version
            .sorted_steps()
            .iter()
            .map(|s| s.readable_id.as_str())
            .collect();
        assert_eq!(sorted, vec!["a", "b"]);
        assert!(version.is_dag());
    }
}
