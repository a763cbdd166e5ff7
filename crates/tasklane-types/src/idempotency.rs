//! Idempotency keys and claims for workflow triggers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TenantId;

/// Hex-encoded digest identifying a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A run holding an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyClaim {
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    /// External id of the run that holds the key.
    pub claimed_by: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}
