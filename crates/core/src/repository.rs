//! The Repository Interface: the sole abstract seam between the agent core
//! and job persistence. Real backends (Postgres, Mongo, ...) implement this
//! trait in their own crate; see `jobagent-store-postgres`.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::host::Host;
use crate::job::Job;

/// Backend-agnostic contract over the job store.
///
/// `claim_one` is the only primitive allowed to transition a job from
/// `pending` to `running`; it MUST do so atomically so that no two agents
/// ever observe the same job. Implementations over backends lacking native
/// find-and-modify need a compensating transaction or a conditional update
/// with retry on write-conflict.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Atomically find the oldest `pending` job whose `job_type` is in
    /// `eligible_types`, transition it to `running`, stamp
    /// `hostname = claimer` and `started = now`, and return it. Returns
    /// `Ok(None)` if no eligible job exists. If `eligible_types` is empty,
    /// returns `Ok(None)` immediately without issuing a query.
    async fn claim_one(
        &self,
        eligible_types: &BTreeSet<String>,
        claimer: &str,
    ) -> Result<Option<Job>, RepositoryError>;

    /// Re-read the given job's current repository state.
    async fn reload(&self, job: &Job) -> Result<Job, RepositoryError>;

    /// Persist all mutable fields of `job`.
    async fn save(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Create a new job record. On success the repository has assigned
    /// `job.id`; callers should use the returned `Job`, not their original.
    async fn insert(&self, job: &Job) -> Result<Job, RepositoryError>;

    /// Upsert the given host's heartbeat record.
    async fn save_host(&self, host: &Host) -> Result<(), RepositoryError>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! An in-memory `Repository` used by core's own unit tests and
    //! available to downstream crates under the `testing` feature, so
    //! downstream crates can exercise the claim/save/retry paths without a
    //! database.

    use std::sync::Mutex;

    use super::*;
    use crate::job::JobStatus;

    #[derive(Default)]
    struct State {
        jobs: Vec<Job>,
        hosts: Vec<Host>,
        next_id: i64,
    }

    /// Single-process, mutex-guarded job store. FIFO ordering matches
    /// `created` ascending, with insertion order as the tie-break, so
    /// ordering stays stable across repeated calls.
    pub struct InMemoryRepository {
        state: Mutex<State>,
    }

    impl Default for InMemoryRepository {
        fn default() -> Self {
            Self {
                state: Mutex::new(State {
                    jobs: Vec::new(),
                    hosts: Vec::new(),
                    next_id: 1,
                }),
            }
        }
    }

    impl InMemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a job directly into the store, as if produced by an
        /// external job-creation path.
        pub fn seed(&self, job: Job) -> Job {
            let mut state = self.state.lock().unwrap();
            let mut job = job;
            job.id = Some(state.next_id);
            state.next_id += 1;
            state.jobs.push(job.clone());
            job
        }

        pub fn all_jobs(&self) -> Vec<Job> {
            self.state.lock().unwrap().jobs.clone()
        }

        pub fn hosts(&self) -> Vec<Host> {
            self.state.lock().unwrap().hosts.clone()
        }
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn claim_one(
            &self,
            eligible_types: &BTreeSet<String>,
            claimer: &str,
        ) -> Result<Option<Job>, RepositoryError> {
            if eligible_types.is_empty() {
                return Ok(None);
            }
            let mut state = self.state.lock().unwrap();
            let idx = state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| {
                    j.status == JobStatus::Pending && eligible_types.contains(&j.job_type)
                })
                .min_by_key(|(_, j)| j.created)
                .map(|(i, _)| i);

            let Some(idx) = idx else {
                return Ok(None);
            };

            let job = &mut state.jobs[idx];
            job.status = JobStatus::Running;
            job.hostname = Some(claimer.to_string());
            job.started = Some(chrono::Utc::now());
            Ok(Some(job.clone()))
        }

        async fn reload(&self, job: &Job) -> Result<Job, RepositoryError> {
            let state = self.state.lock().unwrap();
            state
                .jobs
                .iter()
                .find(|j| j.id == job.id)
                .cloned()
                .ok_or_else(|| RepositoryError::Permanent(anyhow::anyhow!("job not found")))
        }

        async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.jobs.iter_mut().find(|j| j.id == job.id) {
                *existing = job.clone();
                Ok(())
            } else {
                Err(RepositoryError::Permanent(anyhow::anyhow!(
                    "job not found"
                )))
            }
        }

        async fn insert(&self, job: &Job) -> Result<Job, RepositoryError> {
            let mut state = self.state.lock().unwrap();
            let mut job = job.clone();
            job.id = Some(state.next_id);
            state.next_id += 1;
            state.jobs.push(job.clone());
            Ok(job)
        }

        async fn save_host(&self, host: &Host) -> Result<(), RepositoryError> {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.hosts.iter_mut().find(|h| h.hostname == host.hostname) {
                *existing = host.clone();
            } else {
                state.hosts.push(host.clone());
            }
            Ok(())
        }
    }
}
