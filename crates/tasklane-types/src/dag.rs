//! DAG (multi-step run) types and run finalization results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::TenantId;

/// Reference stamped on every task and match that belongs to a DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagRef {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub external_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewDag {
    pub external_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub input: Value,
    pub additional_metadata: Option<Value>,
    pub total_tasks: i32,
    pub parent_task_external_id: Option<Uuid>,
}

/// A persisted DAG. The input lives in the payload store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub external_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub additional_metadata: Option<Value>,
    pub total_tasks: i32,
    pub parent_task_external_id: Option<Uuid>,
}

impl Dag {
    pub fn dag_ref(&self) -> DagRef {
        DagRef {
            id: self.id,
            inserted_at: self.inserted_at,
            external_id: self.external_id,
        }
    }
}

/// Terminal status of a finished workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        })
    }
}

/// A workflow run whose every step reached a terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedRun {
    pub external_id: Uuid,
    pub status: RunStatus,
    /// Output of each completed step, keyed by readable id.
    pub outputs: BTreeMap<String, Value>,
}
