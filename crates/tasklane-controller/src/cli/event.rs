//! `tasklane event`: publish a user event.

use anyhow::{Context, Result};
use tasklane_types::event::CandidateEvent;
use tasklane_types::task::TenantId;
use uuid::Uuid;

use crate::state::AppState;

pub async fn publish_event(
    state: &AppState,
    tenant: Uuid,
    key: String,
    data: &str,
    resource_hint: Option<String>,
) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).context("event data must be valid JSON")?;
    let event = CandidateEvent::user(key, resource_hint, data);

    let written = state
        .engine
        .process_events(TenantId::from_uuid(tenant), vec![event])
        .await?;

    println!("{}", serde_json::to_string_pretty(&written)?);
    Ok(())
}
