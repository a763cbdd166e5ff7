//! Idempotency keys for triggers and the claim rules around them.
//!
//! `RUN` keys depend only on the workflow name and the canonical input, so
//! priority and metadata do not change them. `WAIT_FOR` keys depend on the
//! sorted set of canonical conditions.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tasklane_types::idempotency::{IdempotencyClaim, IdempotencyKey};
use tasklane_types::workflow::StepCondition;
use uuid::Uuid;

use crate::hash::{canonical_json, sha256_hex};

pub fn run_key(workflow_name: &str, input: &Value) -> IdempotencyKey {
    let input = canonical_json(input);
    IdempotencyKey(sha256_hex(&[b"run", workflow_name.as_bytes(), input.as_bytes()]))
}

/// Key of a wait on a set of conditions. Group ids are not part of the key.
pub fn wait_for_key(conditions: &[StepCondition]) -> IdempotencyKey {
    let mut canonical: Vec<String> = conditions
        .iter()
        .map(|c| {
            canonical_json(&json!({
                "kind": c.kind,
                "expression": c.expression,
                "action": c.action,
                "readable_data_key": c.readable_data_key,
            }))
        })
        .collect();
    canonical.sort();

    let mut parts: Vec<&[u8]> = vec![b"wait_for"];
    parts.extend(canonical.iter().map(|c| c.as_bytes()));
    IdempotencyKey(sha256_hex(&parts))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Nobody holds the key; take it.
    Claim,
    /// The requesting run already holds it.
    Held,
    /// Another run holds it but is due a re-check; reclaim if that run has
    /// finalized.
    Recheck { claimant: Uuid },
    /// Another run holds it.
    Rejected { claimant: Uuid },
}

pub fn decide_claim(
    existing: Option<&IdempotencyClaim>,
    requester: Uuid,
    now: DateTime<Utc>,
    recheck_interval: Duration,
) -> ClaimDecision {
    match existing {
        None => ClaimDecision::Claim,
        Some(claim) if claim.claimed_by == requester => ClaimDecision::Held,
        Some(claim) if now - claim.last_checked_at >= recheck_interval => ClaimDecision::Recheck {
            claimant: claim.claimed_by,
        },
        Some(claim) => ClaimDecision::Rejected {
            claimant: claim.claimed_by,
        },
    }
}
