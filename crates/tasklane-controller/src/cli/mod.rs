//! CLI command definitions for the `tasklane` binary.
//!
//! `run` drives the periodic sweeps; the other commands are one-shot
//! operations against the same database.

pub mod event;
pub mod workflow;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Durable task orchestration controller.
#[derive(Parser)]
#[command(name = "tasklane", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sweep loop until interrupted.
    Run {
        /// Seconds between passes; overrides `sweep_interval_secs`.
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Run one sweep pass and exit.
    Sweep {
        /// Only sweep this tenant.
        #[arg(long)]
        tenant: Option<Uuid>,
    },

    /// Manage workflow versions and runs.
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Publish a user event to the match engine.
    Event {
        #[arg(long)]
        tenant: Uuid,

        /// Event key conditions wait on.
        key: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Only conditions hinted with this resource (or unhinted) see it.
        #[arg(long)]
        resource_hint: Option<String>,
    },
}
