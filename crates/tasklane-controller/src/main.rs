//! Tasklane controller entry point.
//!
//! Binary name: `tasklane`
//!
//! Loads `config.toml` from the data directory, opens the database and either
//! runs the sweep loop or executes a one-shot command.

mod cli;
mod state;
mod sweeper;

use std::time::Duration;

use clap::Parser;
use tasklane_observe::{init_tracing, shutdown_tracing, TracingOptions};
use tasklane_types::task::TenantId;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;
    let result = dispatch(cli.command, &state).await;

    shutdown_tracing();
    result
}

async fn dispatch(command: Commands, state: &AppState) -> anyhow::Result<()> {
    match command {
        Commands::Run { interval_secs } => {
            let interval =
                Duration::from_secs(interval_secs.unwrap_or(state.config.sweep_interval_secs));
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("shutdown requested");
                signal_cancel.cancel();
            });
            sweeper::run(&state.engine, interval, cancel).await;
        }

        Commands::Sweep { tenant } => {
            let swept = match tenant {
                Some(tenant) => {
                    sweeper::sweep_tenants(&state.engine, &[TenantId::from_uuid(tenant)]).await
                }
                None => sweeper::sweep_all(&state.engine).await?,
            };
            for (tenant, totals) in swept {
                println!(
                    "{tenant}: timeouts={} reassignments={} retries={} sleeps={}",
                    totals.timeouts, totals.reassignments, totals.retries, totals.sleeps
                );
            }
        }

        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, state).await?;
        }

        Commands::Event {
            tenant,
            key,
            data,
            resource_hint,
        } => {
            cli::event::publish_event(state, tenant, key, &data, resource_hint).await?;
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
