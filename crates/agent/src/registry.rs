//! Job-type registry: maps a `job.job_type` string to the user-supplied code
//! that actually executes it.
//!
//! This is an external collaborator consumed by the core through a narrow
//! interface; the core never sees this module. `JobRegistry` maps job-type
//! strings to boxed async handlers over an opaque `serde_json::Value`
//! payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobagent_core::job::Job;

/// User-supplied execution logic for one job type. Implementors interpret
/// `job.payload` however they like; the core never does.
///
/// Implementations may mutate and persist `job` themselves mid-run (e.g. to
/// report `completion` progress, or even write a terminal status) via their
/// own repository handle; the child runner does not give them one, since
/// that handle is reconnected fresh before `run` is called and is owned by
/// whichever registration needs it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, job: &Job) -> anyhow::Result<()>;
}

/// Maps job-type names to their registered executor. Built once at agent
/// setup from the configured `imports` list.
#[derive(Default, Clone)]
pub struct JobRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(job_type.into(), executor);
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }

    pub async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        let executor = self
            .executors
            .get(&job.job_type)
            .ok_or_else(|| anyhow::anyhow!("unregistered job type: {}", job.job_type))?;
        executor.run(job).await
    }
}

/// Demo executor: succeeds immediately. Useful for smoke-testing the agent
/// end to end without any real job-type module.
pub struct EchoExecutor;

#[async_trait]
impl JobExecutor for EchoExecutor {
    async fn run(&self, job: &Job) -> anyhow::Result<()> {
        tracing::info!(job_uuid = %job.uuid, payload = %job.payload, "echo job ran");
        Ok(())
    }
}

/// Demo executor: sleeps for `payload.seconds` (default 10s) before
/// returning. Useful for exercising the per-job timeout path without any
/// real job-type module.
pub struct SleepExecutor;

#[async_trait]
impl JobExecutor for SleepExecutor {
    async fn run(&self, job: &Job) -> anyhow::Result<()> {
        let seconds = job
            .payload
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);
        tracing::debug!(job_uuid = %job.uuid, seconds, "sleep job starting");
        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
        Ok(())
    }
}

/// Builds the registry from the configured `imports` list. Unknown imports
/// are logged and skipped rather than treated as fatal. A job-type module
/// the agent doesn't recognize simply never gets claimed, since
/// `available_by_type` only offers types with declared slot capacity, and
/// capacity for an unregistered type would just dead-end every claim.
pub fn build_from_imports(imports: &[String]) -> JobRegistry {
    let mut registry = JobRegistry::new();
    for import in imports {
        match import.as_str() {
            "echo" => registry.register("echo", Arc::new(EchoExecutor)),
            "sleep" => registry.register("sleep", Arc::new(SleepExecutor)),
            other => {
                tracing::warn!(job_type = %other, "no built-in executor for imported job type");
            }
        }
    }
    registry
}
