//! `tasklane workflow`: register versions, trigger runs, inspect results.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};
use tasklane_core::engine::TriggerOpts;
use tasklane_core::trigger::run_key;
use tasklane_types::task::TenantId;
use tasklane_types::workflow::WorkflowVersion;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow version from a JSON file.
    Put {
        #[arg(long)]
        tenant: Uuid,

        /// Path to the version JSON.
        file: PathBuf,
    },

    /// Trigger a run of a registered version.
    Trigger {
        #[arg(long)]
        tenant: Uuid,

        /// Workflow version id.
        version: Uuid,

        /// JSON input of the run.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Run external id (generated when omitted).
        #[arg(long)]
        run_id: Option<Uuid>,

        /// Deduplicate by workflow name and input.
        #[arg(long)]
        idempotent: bool,
    },

    /// Show finalized runs among the given ids.
    Status {
        #[arg(long)]
        tenant: Uuid,

        run_ids: Vec<Uuid>,
    },
}

pub async fn handle_workflow_command(action: WorkflowCommand, state: &AppState) -> Result<()> {
    match action {
        WorkflowCommand::Put { tenant, file } => put_version(state, tenant, &file).await,
        WorkflowCommand::Trigger {
            tenant,
            version,
            input,
            run_id,
            idempotent,
        } => trigger(state, tenant, version, &input, run_id, idempotent).await,
        WorkflowCommand::Status { tenant, run_ids } => status(state, tenant, &run_ids).await,
    }
}

/// Parse a workflow version document.
pub fn parse_version(content: &str) -> Result<WorkflowVersion> {
    let version: WorkflowVersion =
        serde_json::from_str(content).context("invalid workflow version JSON")?;
    if version.steps.is_empty() {
        bail!("workflow version '{}' has no steps", version.workflow_name);
    }
    Ok(version)
}

async fn put_version(state: &AppState, tenant: Uuid, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let version = parse_version(&content)?;
    state
        .engine
        .put_workflow_version(TenantId::from_uuid(tenant), &version)
        .await?;

    let summary = json!({
        "id": version.id,
        "workflow": version.workflow_name,
        "steps": version.steps.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn trigger(
    state: &AppState,
    tenant: Uuid,
    version_id: Uuid,
    input: &str,
    run_id: Option<Uuid>,
    idempotent: bool,
) -> Result<()> {
    let tenant = TenantId::from_uuid(tenant);
    let input: Value = serde_json::from_str(input).context("run input must be valid JSON")?;

    let mut opts = TriggerOpts::new(version_id, input.clone());
    if let Some(run_id) = run_id {
        opts.external_id = run_id;
    }
    if idempotent {
        let version = state.engine.get_workflow_version(tenant, version_id).await?;
        opts.idempotency_key = Some(run_key(&version.workflow_name, &input));
    }

    let run = state
        .engine
        .trigger_workflow_runs(tenant, vec![opts])
        .await?
        .into_iter()
        .next()
        .context("trigger returned no run")?;

    let summary = json!({
        "run_id": run.external_id,
        "reused": run.reused,
        "queued": run.tasks.iter().map(|t| &t.step_readable_id).collect::<Vec<_>>(),
        "waiting": run.matches.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn status(state: &AppState, tenant: Uuid, run_ids: &[Uuid]) -> Result<()> {
    let finalized = state
        .engine
        .list_finalized_workflow_runs(TenantId::from_uuid(tenant), run_ids)
        .await?;
    println!("{}", serde_json::to_string_pretty(&finalized)?);
    Ok(())
}
