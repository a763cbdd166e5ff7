//! Task events and candidate events.
//!
//! `TaskEvent` is the append-only history of a task. `CandidateEvent` is the
//! shape the match engine consumes: either derived from a task event
//! (internal) or submitted from outside (user).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ParseEnumError;
use crate::matching::MatchEventType;
use crate::task::{TaskIdInsertedAt, TaskIdInsertedAtRetryCount, TenantId};

/// Type of a recorded task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    Completed,
    Failed,
    Cancelled,
    SignalCreated,
    SignalCompleted,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventType::Completed => "COMPLETED",
            TaskEventType::Failed => "FAILED",
            TaskEventType::Cancelled => "CANCELLED",
            TaskEventType::SignalCreated => "SIGNAL_CREATED",
            TaskEventType::SignalCompleted => "SIGNAL_COMPLETED",
        }
    }

    /// Terminal events close an attempt; signal events do not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventType::Completed | TaskEventType::Failed | TaskEventType::Cancelled
        )
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(TaskEventType::Completed),
            "FAILED" => Ok(TaskEventType::Failed),
            "CANCELLED" => Ok(TaskEventType::Cancelled),
            "SIGNAL_CREATED" => Ok(TaskEventType::SignalCreated),
            "SIGNAL_COMPLETED" => Ok(TaskEventType::SignalCompleted),
            other => Err(ParseEnumError::new("task event type", other)),
        }
    }
}

/// A persisted task event. The event data lives in the payload store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub task_id: i64,
    pub task_inserted_at: DateTime<Utc>,
    pub task_external_id: Uuid,
    pub retry_count: i32,
    pub event_type: TaskEventType,
    pub event_key: Option<String>,
    pub is_current_retry: bool,
}

impl TaskEvent {
    pub fn task_key(&self) -> TaskIdInsertedAt {
        TaskIdInsertedAt {
            id: self.task_id,
            inserted_at: self.task_inserted_at,
        }
    }
}

/// An event to append. `data` is written to the payload store alongside it.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task: TaskIdInsertedAtRetryCount,
    pub task_external_id: Uuid,
    pub event_type: TaskEventType,
    pub event_key: Option<String>,
    pub data: Value,
    pub is_current_retry: bool,
}

/// An event offered to the match engine.
///
/// For internal events `key` is the task event type and `resource_hint` the
/// emitting task's external id. `output` carries the task output when the
/// event is a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: MatchEventType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_hint: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl CandidateEvent {
    /// Candidate derived from a terminal task event.
    pub fn internal(event_type: TaskEventType, task_external_id: Uuid, data: Value) -> Self {
        let output = match event_type {
            TaskEventType::Completed => Some(data.clone()),
            _ => None,
        };
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            kind: MatchEventType::Internal,
            key: event_type.as_str().to_string(),
            resource_hint: Some(task_external_id.to_string()),
            data,
            output,
        }
    }

    /// Candidate submitted from outside the engine.
    pub fn user(key: impl Into<String>, resource_hint: Option<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            kind: MatchEventType::User,
            key: key.into(),
            resource_hint,
            data,
            output: None,
        }
    }

    /// Scope bound to `output` when evaluating conditions: the task output
    /// when present, otherwise the event data.
    pub fn output_scope(&self) -> &Value {
        self.output.as_ref().unwrap_or(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_terminality() {
        assert!(TaskEventType::Completed.is_terminal());
        assert!(TaskEventType::Cancelled.is_terminal());
        assert!(!TaskEventType::SignalCreated.is_terminal());
        assert!(!TaskEventType::SignalCompleted.is_terminal());
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!(
            "SIGNAL_CREATED".parse::<TaskEventType>().unwrap(),
            TaskEventType::SignalCreated
        );
        assert!("DONE".parse::<TaskEventType>().is_err());
    }

    #[test]
    fn test_internal_candidate_carries_output_for_completions() {
        let ext = Uuid::now_v7();
        let completed = CandidateEvent::internal(TaskEventType::Completed, ext, json!({"x": 1}));
        assert_eq!(completed.key, "COMPLETED");
        assert_eq!(completed.resource_hint.as_deref(), Some(ext.to_string().as_str()));
        assert_eq!(completed.output_scope(), &json!({"x": 1}));

        let failed = CandidateEvent::internal(TaskEventType::Failed, ext, json!({"error": "boom"}));
        assert!(failed.output.is_none());
        assert_eq!(failed.output_scope(), &json!({"error": "boom"}));
    }

    #[test]
    fn test_user_candidate_has_no_output() {
        let event = CandidateEvent::user("order:paid", None, json!({"amount": 3}));
        assert_eq!(event.kind, MatchEventType::User);
        assert!(event.output.is_none());
    }
}
