//! `jobagent` binary: CLI entry point. Dispatches to either the long-running
//! agent loop (`run`, the default) or the hidden per-job child entry point
//! (`run-job`) the parent re-execs itself with.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use jobagent_agent::child_runner::{self, RunJobArgs};
use jobagent_agent::cli::{Cli, Commands};
use jobagent_agent::config::AgentFileConfig;
use jobagent_agent::registry;
use jobagent_agent::telemetry::SysinfoReporter;
use jobagent_core::child::{ChildProcessConfig, TokioProcessSpawner};
use jobagent_core::lifecycle::{Agent, AgentConfig};
use jobagent_store_postgres::PgRepository;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::RunJob { job_id, slot }) => {
            // The child gets its own minimal logging setup in
            // `child_runner::run` once it knows whether a per-slot log file
            // is configured; don't install a second global subscriber here.
            let code = child_runner::run(RunJobArgs {
                job_id,
                slot_number: slot,
                config_path: cli.config,
            })
            .await;
            std::process::exit(code);
        }
        Some(Commands::Run) | None => {
            init_logging();
            run_agent(cli.config).await
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobagent=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}

async fn run_agent(config_path: std::path::PathBuf) -> Result<()> {
    let file_config = AgentFileConfig::load(&config_path)
        .context("failed to load agent config")?;

    let hostname = std::env::var("JOBAGENT_HOSTNAME")
        .ok()
        .or_else(sysinfo::System::host_name)
        .context("could not resolve a hostname for this agent (set JOBAGENT_HOSTNAME)")?;

    let registry = registry::build_from_imports(&file_config.imports);
    for job_type in file_config.slots.keys() {
        if !registry.is_registered(job_type) {
            tracing::warn!(
                job_type = %job_type,
                "job type has declared slot capacity but no registered executor"
            );
        }
    }

    let repo = Arc::new(
        PgRepository::connect(&file_config.database_url())
            .await
            .context("failed to connect to job repository")?,
    );
    repo.migrate().await.context("failed to run repository migrations")?;

    let exe_path = std::env::current_exe().context("could not resolve current executable path")?;
    let agent_config = AgentConfig {
        hostname: hostname.clone(),
        job_slots: file_config.slots.clone(),
        loop_duration: file_config.loop_duration(),
        update_interval: file_config.update_interval(),
        child_config: ChildProcessConfig {
            exe_path,
            config_path,
            log_file: file_config.log_file.clone(),
        },
    };

    let mut agent = Agent::setup(
        repo,
        Arc::new(TokioProcessSpawner),
        Arc::new(SysinfoReporter::new()),
        agent_config,
    )
    .await
    .context("agent setup failed")?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        shutdown_signal.cancel();
    });

    info!(hostname = %hostname, "agent running, entering supervisor loop");
    agent
        .run_until_shutdown(file_config.loop_duration(), shutdown)
        .await
        .context("supervisor loop exited with an error")?;

    agent.shutdown().await.context("agent shutdown failed")?;
    Ok(())
}
