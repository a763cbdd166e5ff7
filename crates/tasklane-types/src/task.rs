//! Task domain types.
//!
//! A task is one execution attempt of one workflow step. Tasks are addressed
//! by `(id, inserted_at)`; the `retry_count` acts as an optimistic version so
//! `(id, retry_count)` names exactly one attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::DagRef;
use crate::error::ParseEnumError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Tenant identifier. Every row in the system belongs to exactly one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Primary key of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdInsertedAt {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
}

/// One specific attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdInsertedAtRetryCount {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub retry_count: i32,
}

impl TaskIdInsertedAtRetryCount {
    pub fn key(&self) -> TaskIdInsertedAt {
        TaskIdInsertedAt {
            id: self.id,
            inserted_at: self.inserted_at,
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// The state a task is created in.
///
/// Anything other than `Queued` is already terminal: the task never runs and
/// a terminal event is written at creation so downstream matches observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskInitialState {
    Queued,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskInitialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskInitialState::Queued => "QUEUED",
            TaskInitialState::Failed => "FAILED",
            TaskInitialState::Cancelled => "CANCELLED",
            TaskInitialState::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TaskInitialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskInitialState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskInitialState::Queued),
            "FAILED" => Ok(TaskInitialState::Failed),
            "CANCELLED" => Ok(TaskInitialState::Cancelled),
            "SKIPPED" => Ok(TaskInitialState::Skipped),
            other => Err(ParseEnumError::new("task initial state", other)),
        }
    }
}

/// Current status projection of a task's latest attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

impl From<TaskInitialState> for TaskStatus {
    fn from(state: TaskInitialState) -> Self {
        match state {
            TaskInitialState::Queued => TaskStatus::Queued,
            TaskInitialState::Failed => TaskStatus::Failed,
            TaskInitialState::Cancelled => TaskStatus::Cancelled,
            TaskInitialState::Skipped => TaskStatus::Skipped,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            "SKIPPED" => Ok(TaskStatus::Skipped),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Application-level retry policy, copied from the step onto each task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of app-level retries allowed after the first attempt.
    pub max_retries: i32,
    /// Exponential backoff base in seconds; `None` retries immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    /// Cap on the computed backoff, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<i64>,
}

/// Link from a spawned child workflow back to the task that spawned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub task: TaskIdInsertedAtRetryCount,
    pub external_id: Uuid,
    pub child_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_key: Option<String>,
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub external_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    /// DAG external id for multi-step runs, otherwise the task's own external id.
    pub workflow_run_id: Uuid,
    pub step_id: Uuid,
    pub step_readable_id: String,
    pub action_id: String,
    pub dag: Option<DagRef>,
    pub retry_count: i32,
    pub internal_retry_count: i32,
    pub initial_state: TaskInitialState,
    pub initial_state_reason: Option<String>,
    pub status: TaskStatus,
    pub priority: i32,
    pub queue: String,
    pub concurrency_keys: Vec<String>,
    pub step_expression_values: BTreeMap<String, Value>,
    pub parent: Option<ParentLink>,
    pub retry_policy: RetryPolicy,
    pub timeout_secs: i64,
    pub additional_metadata: Option<Value>,
}

impl Task {
    pub fn key(&self) -> TaskIdInsertedAt {
        TaskIdInsertedAt {
            id: self.id,
            inserted_at: self.inserted_at,
        }
    }

    pub fn attempt(&self) -> TaskIdInsertedAtRetryCount {
        TaskIdInsertedAtRetryCount {
            id: self.id,
            inserted_at: self.inserted_at,
            retry_count: self.retry_count,
        }
    }
}

/// The decoded input payload handed to a task.
///
/// `input` is the run input; `parents` holds the outputs of completed parent
/// steps keyed by readable id; `triggers` holds data from any other satisfied
/// conditions (sleeps, user events) keyed by readable data key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub input: Value,
    #[serde(default)]
    pub parents: BTreeMap<String, Value>,
    #[serde(default)]
    pub triggers: BTreeMap<String, Vec<Value>>,
}

impl TaskInput {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            parents: BTreeMap::new(),
            triggers: BTreeMap::new(),
        }
    }
}

/// Row to insert for a new task (ids and timestamps are assigned by storage).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub external_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub workflow_run_id: Uuid,
    pub step_id: Uuid,
    pub step_readable_id: String,
    pub action_id: String,
    pub dag: Option<DagRef>,
    pub initial_state: TaskInitialState,
    pub initial_state_reason: Option<String>,
    pub priority: i32,
    pub queue: String,
    pub concurrency_keys: Vec<String>,
    pub step_expression_values: BTreeMap<String, Value>,
    pub parent: Option<ParentLink>,
    pub retry_policy: RetryPolicy,
    pub timeout_secs: i64,
    pub additional_metadata: Option<Value>,
}

/// In-place replay of an existing task: bumps `retry_count` and resets state.
#[derive(Debug, Clone)]
pub struct ReplayTask {
    pub task: TaskIdInsertedAt,
    pub initial_state: TaskInitialState,
    pub initial_state_reason: Option<String>,
    pub concurrency_keys: Vec<String>,
    pub step_expression_values: BTreeMap<String, Value>,
}

/// Outcome of releasing one attempt.
///
/// `released` is false when the attempt was stale or had already been
/// released; `task` reflects the row after the release.
#[derive(Debug, Clone)]
pub struct ReleasedTask {
    pub task: Task,
    pub released: bool,
}

/// A retry to schedule for an attempt that was just released as failed.
#[derive(Debug, Clone)]
pub struct ScheduledRetry {
    pub task: TaskIdInsertedAtRetryCount,
    /// Internal (engine-level) retries also bump `internal_retry_count`.
    pub is_internal: bool,
    /// When set, the retry waits in the retry queue until this instant.
    pub retry_after: Option<DateTime<Utc>>,
}

/// Hand-off of a queued attempt to a worker, written by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub task: TaskIdInsertedAtRetryCount,
    pub worker_id: Uuid,
    pub timeout_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// A durable sleep registered by a waiting task or a sleep condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableSleep {
    pub id: i64,
    pub tenant_id: TenantId,
    pub sleep_until: DateTime<Utc>,
    pub sleep_duration_secs: i64,
}

impl DurableSleep {
    /// Event key carried by the synthetic event emitted when the sleep expires.
    pub fn event_key(&self) -> String {
        sleep_event_key(self.id)
    }
}

pub fn sleep_event_key(sleep_id: i64) -> String {
    format!("sleep-{sleep_id}")
}
