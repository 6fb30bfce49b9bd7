//! CLI wiring: `clap` derive for the agent's command surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jobagent")]
#[command(about = "Claims, supervises, and retries jobs from a shared job repository")]
pub struct Cli {
    /// Path to the agent's YAML config file.
    #[arg(long, short = 'c', global = true, default_value = "jobagent.yaml", env = "JOBAGENT_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent's claim/supervise/retry loop until shutdown (the
    /// default when no subcommand is given).
    Run,

    /// Hidden entry point for a single job, re-exec'd by the parent
    /// supervisor. Not intended to be invoked by hand.
    #[command(hide = true, name = "run-job")]
    RunJob {
        #[arg(long = "job-id")]
        job_id: i64,
        #[arg(long)]
        slot: u32,
    },
}
