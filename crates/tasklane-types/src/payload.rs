//! Payload store keys.
//!
//! Task inputs, DAG inputs and event data are kept out of the task and event
//! rows and addressed by `(id, inserted_at, tenant, type)`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadType {
    TaskInput,
    DagInput,
    TaskEventData,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::TaskInput => "TASK_INPUT",
            PayloadType::DagInput => "DAG_INPUT",
            PayloadType::TaskEventData => "TASK_EVENT_DATA",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK_INPUT" => Ok(PayloadType::TaskInput),
            "DAG_INPUT" => Ok(PayloadType::DagInput),
            "TASK_EVENT_DATA" => Ok(PayloadType::TaskEventData),
            other => Err(ParseEnumError::new("payload type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadKey {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub payload_type: PayloadType,
}

impl PayloadKey {
    pub fn new(id: i64, inserted_at: DateTime<Utc>, payload_type: PayloadType) -> Self {
        Self {
            id,
            inserted_at,
            payload_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorePayload {
    pub key: PayloadKey,
    pub value: Value,
}
