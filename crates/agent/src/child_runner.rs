//! Child Runner: the entry point executed inside a spawned OS child process.
//!
//! Reached via the hidden `run-job` subcommand the parent re-execs itself
//! with: `(job_id, slot_number, connection_config)` only. A fresh re-exec
//! keeps the child from inheriting any parent in-process state, unlike a
//! fork-and-inherit approach.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobagent_core::job::Job;
use jobagent_store_postgres::PgRepository;
use tracing::{error, info};

use crate::config::AgentFileConfig;
use crate::registry::{self, JobRegistry};

pub struct RunJobArgs {
    pub job_id: i64,
    pub slot_number: u32,
    pub config_path: PathBuf,
}

/// Runs the child to completion and returns the process exit code. Never
/// panics out of this function; translate every failure into an exit code
/// instead, logging with the job uuid and exiting 1.
pub async fn run(args: RunJobArgs) -> i32 {
    install_signal_policy();

    let config = match AgentFileConfig::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "child failed to load config");
            return 1;
        }
    };

    if let Some(log_file) = child_log_path(config.log_file.as_deref(), args.slot_number) {
        init_child_logging(&log_file);
    }

    match run_job(&config, args.job_id).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, job_id = args.job_id, "child job run failed");
            1
        }
    }
}

async fn run_job(config: &AgentFileConfig, job_id: i64) -> Result<()> {
    // Independent connection; no state inherited from the parent's pool.
    let repo = PgRepository::connect(&config.database_url())
        .await
        .context("child failed to connect to repository")?;

    let stub = Job::builder().job_type(String::new()).id(job_id).build();
    let job = repo
        .reload(&stub)
        .await
        .context("child failed to reload job")?;

    info!(job_uuid = %job.uuid, job_type = %job.job_type, "child running job");

    let registry = registry::build_from_imports(&config.imports);

    // A panicking executor must still translate to exit code 1 rather than
    // taking the whole child process down uncleanly.
    let job_for_task = job.clone();
    let registry = std::sync::Arc::new(registry);
    let outcome = tokio::spawn(async move { registry.execute(&job_for_task).await }).await;

    match outcome {
        Ok(Ok(())) => {
            info!(job_uuid = %job.uuid, "child job completed");
            Ok(())
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("job {} run() returned an error", job.uuid)),
        Err(join_err) => Err(anyhow::anyhow!(
            "job {} panicked during run(): {join_err}",
            job.uuid
        )),
    }
}

/// Ignore interactive interrupts and user signals so only the parent's
/// explicit termination (a kill of this process, not a signal forwarded
/// through the controlling terminal's process group) affects the child.
/// Only meaningful on Unix; Windows has no equivalent signal-forwarding
/// concern for console process groups here.
#[cfg(unix)]
fn install_signal_policy() {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::interrupt(), SignalKind::user_defined1(), SignalKind::user_defined2()] {
        if let Ok(mut stream) = signal(kind) {
            tokio::spawn(async move {
                loop {
                    stream.recv().await;
                }
            });
        }
    }
}

#[cfg(not(unix))]
fn install_signal_policy() {}

/// `<base>.process-<NN>.<ext>`, re-derived here independently of
/// `jobagent_core::child::per_slot_log_path` since the child only has the
/// base path via its own config file, not the parent's in-memory
/// `ChildProcessConfig`.
fn child_log_path(base: Option<&Path>, slot_number: u32) -> Option<PathBuf> {
    jobagent_core::child::per_slot_log_path(base, slot_number)
}

/// Redirects this process's log output to a slot-specific file. Errors
/// opening the file are non-fatal; the child falls back to its inherited
/// stdio rather than failing the job over a logging problem.
fn init_child_logging(path: &Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let Some(dir) = path.parent() else { return };
    let Some(file_name) = path.file_name() else {
        return;
    };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    // Leak the guard: this process lives only as long as the job run, and
    // we need buffered logs flushed for the process's entire lifetime.
    std::mem::forget(guard);

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();
}
