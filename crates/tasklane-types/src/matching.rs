//! Match and condition types.
//!
//! A match is a set of condition groups waiting on events. Conditions inside a
//! group are OR-ed; how groups combine depends on their action. When a match
//! is satisfied it produces a task (trigger) or completes a signal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::DagRef;
use crate::error::ParseEnumError;
use crate::task::{ParentLink, TaskIdInsertedAt, TaskIdInsertedAtRetryCount, TaskInput, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    Trigger,
    Signal,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Trigger => "TRIGGER",
            MatchKind::Signal => "SIGNAL",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIGGER" => Ok(MatchKind::Trigger),
            "SIGNAL" => Ok(MatchKind::Signal),
            other => Err(ParseEnumError::new("match kind", other)),
        }
    }
}

/// Where a candidate event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchEventType {
    /// Derived from task events or expired durable sleeps.
    Internal,
    /// Submitted by a caller.
    User,
}

impl MatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchEventType::Internal => "INTERNAL",
            MatchEventType::User => "USER",
        }
    }
}

impl fmt::Display for MatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERNAL" => Ok(MatchEventType::Internal),
            "USER" => Ok(MatchEventType::User),
            other => Err(ParseEnumError::new("match event type", other)),
        }
    }
}

/// What a satisfied condition group asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchAction {
    Queue,
    Cancel,
    Skip,
    Create,
    CreateMatch,
}

impl MatchAction {
    /// Every action, highest precedence first.
    pub const BY_PRECEDENCE: [MatchAction; 5] = [
        MatchAction::Cancel,
        MatchAction::Skip,
        MatchAction::Create,
        MatchAction::CreateMatch,
        MatchAction::Queue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAction::Queue => "QUEUE",
            MatchAction::Cancel => "CANCEL",
            MatchAction::Skip => "SKIP",
            MatchAction::Create => "CREATE",
            MatchAction::CreateMatch => "CREATE_MATCH",
        }
    }

    /// Cancel groups fire on any satisfied group; every other action needs
    /// all of its groups.
    pub fn requires_all_groups(&self) -> bool {
        !matches!(self, MatchAction::Cancel)
    }
}

impl fmt::Display for MatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUE" => Ok(MatchAction::Queue),
            "CANCEL" => Ok(MatchAction::Cancel),
            "SKIP" => Ok(MatchAction::Skip),
            "CREATE" => Ok(MatchAction::Create),
            "CREATE_MATCH" => Ok(MatchAction::CreateMatch),
            other => Err(ParseEnumError::new("match action", other)),
        }
    }
}

/// A condition to insert with a new match.
///
/// `satisfied_data` pre-satisfies the condition, which replay uses for
/// parents that are not being replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatchCondition {
    pub group_id: Uuid,
    pub event_type: MatchEventType,
    pub event_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_resource_hint: Option<String>,
    pub expression: String,
    pub action: MatchAction,
    pub readable_data_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied_data: Option<Value>,
}

/// A persisted condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMatchCondition {
    pub id: i64,
    pub match_id: i64,
    pub group_id: Uuid,
    pub event_type: MatchEventType,
    pub event_key: String,
    pub event_resource_hint: Option<String>,
    pub expression: String,
    pub action: MatchAction,
    pub readable_data_key: String,
    pub is_satisfied: bool,
    pub data: Option<Value>,
}

/// A match that creates (or replays) a task when satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerTarget {
    pub dag: Option<DagRef>,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub step_id: Uuid,
    pub step_readable_id: String,
    pub external_id: Uuid,
    pub workflow_run_id: Uuid,
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    /// Set when the match replays an existing task instead of creating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_task: Option<TaskIdInsertedAt>,
    /// Input accumulated so far; merged with the decision data on fire.
    pub input: TaskInput,
}

/// A match that completes a durable wait on a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTarget {
    /// The attempt that registered the wait.
    pub task: TaskIdInsertedAtRetryCount,
    pub external_id: Uuid,
    pub signal_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchTarget {
    Trigger(Box<TriggerTarget>),
    Signal(SignalTarget),
}

impl MatchTarget {
    pub fn kind(&self) -> MatchKind {
        match self {
            MatchTarget::Trigger(_) => MatchKind::Trigger,
            MatchTarget::Signal(_) => MatchKind::Signal,
        }
    }

    /// The waiting attempt of a signal match.
    pub fn signal_attempt(&self) -> Option<TaskIdInsertedAtRetryCount> {
        match self {
            MatchTarget::Trigger(_) => None,
            MatchTarget::Signal(signal) => Some(signal.task),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    pub target: MatchTarget,
    pub conditions: Vec<NewMatchCondition>,
}

/// A persisted match with all of its conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    pub tenant_id: TenantId,
    pub kind: MatchKind,
    pub is_satisfied: bool,
    pub target: MatchTarget,
    pub aggregated_data: Option<Value>,
    pub conditions: Vec<GroupMatchCondition>,
}

/// Outcome of resolving a satisfied match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub action: MatchAction,
    /// `{ action: { readable_data_key: [data, ...] } }` over every satisfied
    /// condition.
    pub aggregated_data: Value,
    /// Outputs of parents whose completion satisfied the winning action.
    pub parent_outputs: BTreeMap<String, Value>,
    /// Data of the winning action's other satisfied conditions.
    pub trigger_data: BTreeMap<String, Vec<Value>>,
}
