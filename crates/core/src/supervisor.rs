//! The Job Supervisor: the central tick. Reap finished or timed-out
//! children, claim up to available capacity, spawn children for each claim,
//! throttle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::child::{ChildHandle, ChildProcessConfig, ProcessSpawner};
use crate::error::RepositoryError;
use crate::job::{Job, JobStatus};
use crate::repository::Repository;
use crate::retry;
use crate::slots::SlotPool;

/// How long the supervisor waits for a terminated (timed-out or shutdown)
/// child to actually exit before giving up on the join.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(800);

/// How long to pause after enqueueing a retry duplicate, to let peer
/// agents get a fair shot at claiming the jobs ahead of this one in the
/// queue before this agent loops back around.
const POST_RETRY_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub reaped: usize,
    pub claimed: usize,
    pub spawned: usize,
}

pub struct SupervisorConfig {
    pub hostname: String,
    pub loop_duration: Duration,
    pub grace_period: Duration,
}

impl SupervisorConfig {
    pub fn new(hostname: impl Into<String>, loop_duration: Duration) -> Self {
        Self {
            hostname: hostname.into(),
            loop_duration,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// One supervisor per agent process. Owns the slot pool and the child
/// table; both are mutated only from this struct's methods, which are only
/// ever called from the single-threaded supervisor loop.
pub struct Supervisor<R: Repository, P: ProcessSpawner> {
    repo: Arc<R>,
    spawner: Arc<P>,
    slots: SlotPool,
    children: HashMap<u32, ChildHandle>,
    config: SupervisorConfig,
    child_config: ChildProcessConfig,
}

impl<R: Repository, P: ProcessSpawner> Supervisor<R, P> {
    pub fn new(
        repo: Arc<R>,
        spawner: Arc<P>,
        slots: SlotPool,
        config: SupervisorConfig,
        child_config: ChildProcessConfig,
    ) -> Self {
        Self {
            repo,
            spawner,
            slots,
            children: HashMap::new(),
            config,
            child_config,
        }
    }

    pub fn in_flight_by_type(&self) -> HashMap<String, u32> {
        self.slots.in_flight_by_type()
    }

    pub fn active_child_count(&self) -> usize {
        self.children.len()
    }

    /// OS pids of every currently-tracked child, for the heartbeat's
    /// `system_snapshot.child_pids`.
    pub fn child_pids(&self) -> Vec<u32> {
        self.children.values().filter_map(|h| h.child.id()).collect()
    }

    /// One iteration of the supervisor loop: (a) reap, (b) claim, (c) spawn,
    /// (d) throttle.
    pub async fn tick(&mut self) -> anyhow::Result<TickOutcome> {
        let reaped = self.reap_children().await;
        let claimed = self.claim_new().await?;
        let spawned = self.spawn_children(&claimed).await;

        if !claimed.is_empty() {
            self.throttle(claimed.len()).await;
        }

        Ok(TickOutcome {
            reaped,
            claimed: claimed.len(),
            spawned,
        })
    }

    /// For each active child: reload → check timeout → check liveness →
    /// invoke callback → maybe retry → release slot.
    async fn reap_children(&mut self) -> usize {
        let now = Instant::now();
        let slot_numbers: Vec<u32> = self.children.keys().copied().collect();
        let mut reaped = 0;

        for slot_number in slot_numbers {
            let Some(handle) = self.children.get_mut(&slot_number) else {
                continue;
            };

            // (1) reload
            let reloaded = match self.repo.reload(&handle.job).await {
                Ok(job) => job,
                Err(e) => {
                    // Transient repository error during reload: leave the
                    // child in place and retry next tick.
                    warn!(slot = slot_number, error = %e, "failed to reload job for active child");
                    continue;
                }
            };
            handle.job = reloaded;

            // (2) timeout check
            let forced_exit_code = if handle.timed_out(now) {
                info!(
                    process = %handle.process_name(),
                    job_uuid = %handle.job.uuid,
                    "job exceeded its timeout, terminating child"
                );
                if let Err(e) = handle.child.terminate(self.config.grace_period).await {
                    error!(process = %handle.process_name(), error = %e, "failed to terminate timed-out child");
                }
                Some(1)
            } else {
                None
            };

            // (3) liveness check, unless already forced above
            let exit_code = match forced_exit_code {
                Some(code) => Some(code),
                None => match handle.child.try_exit_code() {
                    Ok(code) => code,
                    Err(e) => {
                        error!(process = %handle.process_name(), error = %e, "failed to poll child liveness");
                        None
                    }
                },
            };

            let Some(exit_code) = exit_code else {
                // Still running, not timed out: leave it for next tick.
                continue;
            };

            let Some(handle) = self.children.remove(&slot_number) else {
                continue;
            };
            reaped += 1;

            // (3 cont'd) invoke callback
            let callback_result = if exit_code == 0 {
                self.success_callback(&handle.job).await
            } else {
                self.error_callback(&handle.job, exit_code).await
            };
            if let Err(e) = callback_result {
                warn!(process = %handle.process_name(), error = %e, "failed to persist job outcome");
            }

            // (4) maybe retry, using the canonical post-callback state
            if exit_code != 0 {
                match self.repo.reload(&handle.job).await {
                    Ok(current) => {
                        if current.status == JobStatus::Error && current.ttl > 1 {
                            match retry::maybe_retry(self.repo.as_ref(), &current).await {
                                Ok(Some(dup)) => {
                                    info!(
                                        original = %current.uuid,
                                        duplicate = %dup.uuid,
                                        ttl = dup.ttl,
                                        "enqueued retry duplicate"
                                    );
                                    tokio::time::sleep(POST_RETRY_SETTLE).await;
                                }
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "failed to enqueue retry duplicate"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to reload job before evaluating retry"),
                }
            }

            // (5) release slot
            self.slots.release(slot_number, &handle.job.job_type);
        }

        reaped
    }

    /// Claim jobs until no more eligible capacity remains.
    async fn claim_new(&mut self) -> Result<Vec<Job>, RepositoryError> {
        let mut claimed = Vec::new();
        let mut reserved: HashMap<String, u32> = HashMap::new();

        loop {
            let available = self.slots.available_by_type();
            let eligible: BTreeSet<String> = available
                .iter()
                .filter(|(t, avail)| {
                    let already_reserved = reserved.get(*t).copied().unwrap_or(0);
                    **avail > already_reserved
                })
                .map(|(t, _)| t.clone())
                .collect();

            if eligible.is_empty() {
                break;
            }

            match self.repo.claim_one(&eligible, &self.config.hostname).await {
                Ok(Some(job)) => {
                    debug!(job_uuid = %job.uuid, job_type = %job.job_type, "claimed job");
                    *reserved.entry(job.job_type.clone()).or_insert(0) += 1;
                    claimed.push(job);
                }
                Ok(None) => break,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "transient repository error during claim, yielding zero further claims this tick");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(claimed)
    }

    /// Acquire a slot number and spawn a child for each claimed job.
    async fn spawn_children(&mut self, claimed: &[Job]) -> usize {
        let mut spawned = 0;
        for job in claimed {
            let slot_number = self.slots.acquire(&job.job_type);
            match self
                .spawner
                .spawn(job, slot_number, &self.child_config)
                .await
            {
                Ok(child) => {
                    let handle = ChildHandle {
                        slot_number,
                        job: job.clone(),
                        start_time: Instant::now(),
                        child,
                    };
                    info!(process = %handle.process_name(), job_type = %job.job_type, "spawned child");
                    self.children.insert(slot_number, handle);
                    spawned += 1;
                }
                Err(e) => {
                    error!(job_uuid = %job.uuid, error = %e, "failed to spawn child, releasing slot");
                    self.slots.release(slot_number, &job.job_type);
                }
            }
        }
        spawned
    }

    /// Terminate every active child with a bounded grace period and release
    /// its slot. Does not touch job status; the parent's callbacks are the
    /// only writer of terminal state, and a shutdown child's job is
    /// deliberately left `running` for an external reconciler to sweep up.
    pub async fn terminate_all(&mut self, grace: Duration) {
        let slot_numbers: Vec<u32> = self.children.keys().copied().collect();
        for slot_number in slot_numbers {
            let Some(mut handle) = self.children.remove(&slot_number) else {
                continue;
            };
            if let Err(e) = handle.child.terminate(grace).await {
                error!(process = %handle.process_name(), error = %e, "failed to terminate child during shutdown");
            }
            self.slots.release(slot_number, &handle.job.job_type);
        }
    }

    /// Desynchronize agents hitting the repository in lockstep.
    async fn throttle(&self, claims: usize) {
        let secs = self.config.loop_duration.as_secs_f64() * claims as f64 / 10.0;
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    /// Idempotent success callback.
    async fn success_callback(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut reloaded = self.repo.reload(job).await?;
        if !reloaded.status.is_terminal() {
            reloaded.status = JobStatus::Success;
            reloaded.status_text = "Job Successful".to_string();
            reloaded.completion = 100;
            reloaded.finished = Some(chrono::Utc::now());
            self.repo.save(&reloaded).await?;
        }
        Ok(())
    }

    /// Idempotent error callback.
    async fn error_callback(&self, job: &Job, exit_code: i32) -> Result<(), RepositoryError> {
        let mut reloaded = self.repo.reload(job).await?;
        if !reloaded.status.is_terminal() {
            reloaded.status = JobStatus::Error;
            reloaded.status_text = format!("Error - exitcode={exit_code}");
            reloaded.details = format!("Error (callback) : exitcode={exit_code}");
            reloaded.finished = Some(chrono::Utc::now());
            self.repo.save(&reloaded).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::testing::{FakeChild, FakeOutcome};
    use crate::repository::testing::InMemoryRepository;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io;
    use std::sync::Mutex as StdMutex;

    /// A fake spawner whose next `FakeOutcome` is pre-programmed per call,
    /// so tests can script exactly how each child behaves.
    struct ScriptedSpawner {
        outcomes: StdMutex<Vec<FakeOutcome>>,
    }

    impl ScriptedSpawner {
        fn new(outcomes: Vec<FakeOutcome>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl ProcessSpawner for ScriptedSpawner {
        async fn spawn(
            &self,
            _job: &Job,
            _slot_number: u32,
            _config: &ChildProcessConfig,
        ) -> io::Result<Box<dyn crate::child::SpawnedChild>> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(FakeOutcome::ExitAfter { polls: 1, code: 0 });
            Ok(Box::new(FakeChild::new(outcome)))
        }
    }

    fn child_config() -> ChildProcessConfig {
        ChildProcessConfig {
            exe_path: "/bin/true".into(),
            config_path: "/dev/null".into(),
            log_file: None,
        }
    }

    fn slots(cap: u32) -> SlotPool {
        SlotPool::new(HashMap::from([("encode".to_string(), cap)]))
    }

    #[tokio::test]
    async fn happy_path_claims_and_succeeds() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed(Job::new_pending("encode", 3, json!(null)));

        // Outcomes popped LIFO; one child that exits 0 after its first poll.
        let spawner = Arc::new(ScriptedSpawner::new(vec![FakeOutcome::ExitAfter {
            polls: 1,
            code: 0,
        }]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(2),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        let outcome = supervisor.tick().await.unwrap();
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.spawned, 1);
        assert_eq!(supervisor.active_child_count(), 1);

        let running = repo.all_jobs().into_iter().next().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.hostname.as_deref(), Some("host-a"));

        // Next tick: the fake child reports exit 0 on first poll.
        let outcome = supervisor.tick().await.unwrap();
        assert_eq!(outcome.reaped, 1);
        assert_eq!(supervisor.active_child_count(), 0);

        let finished = repo.all_jobs().into_iter().next().unwrap();
        assert_eq!(finished.status, JobStatus::Success);
        assert_eq!(finished.completion, 100);
        assert!(finished.finished.is_some());
    }

    #[tokio::test]
    async fn timeout_terminates_child_and_enqueues_retry() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut job = Job::new_pending("encode", 2, json!(null));
        job.timeout = Some(1);
        repo.seed(job);

        let spawner = Arc::new(ScriptedSpawner::new(vec![FakeOutcome::NeverExits]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(1),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        supervisor.tick().await.unwrap();
        assert_eq!(supervisor.active_child_count(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let outcome = supervisor.tick().await.unwrap();
        assert_eq!(outcome.reaped, 1);
        assert_eq!(supervisor.active_child_count(), 0);

        let jobs = repo.all_jobs();
        assert_eq!(jobs.len(), 2, "a retry duplicate should have been inserted");

        let original = jobs.iter().find(|j| j.ttl == 2).unwrap();
        assert_eq!(original.status, JobStatus::Error);
        assert!(original.status_text.contains("exitcode"));

        let duplicate = jobs.iter().find(|j| j.ttl == 1).unwrap();
        assert_eq!(duplicate.status, JobStatus::Pending);
        assert_ne!(duplicate.uuid, original.uuid);
    }

    #[tokio::test]
    async fn ttl_exhaustion_does_not_insert_duplicate() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed(Job::new_pending("encode", 1, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![FakeOutcome::ExitAfter {
            polls: 1,
            code: 1,
        }]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(1),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        supervisor.tick().await.unwrap();
        supervisor.tick().await.unwrap();

        let jobs = repo.all_jobs();
        assert_eq!(jobs.len(), 1, "no duplicate should be inserted at ttl=1");
        assert_eq!(jobs[0].status, JobStatus::Error);
    }

    #[tokio::test]
    async fn typed_capacity_limits_claims_per_type() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed(Job::new_pending("encode", 3, json!(null)));
        repo.seed(Job::new_pending("encode", 3, json!(null)));
        repo.seed(Job::new_pending("thumb", 3, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![
            FakeOutcome::NeverExits,
            FakeOutcome::NeverExits,
        ]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            SlotPool::new(HashMap::from([
                ("encode".to_string(), 1),
                ("thumb".to_string(), 1),
            ])),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        let outcome = supervisor.tick().await.unwrap();
        assert_eq!(outcome.claimed, 2);

        let jobs = repo.all_jobs();
        let running: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Running).collect();
        let pending: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Pending).collect();
        assert_eq!(running.len(), 2);
        assert_eq!(pending.len(), 1);

        let running_types: BTreeSet<_> = running.iter().map(|j| j.job_type.clone()).collect();
        assert!(running_types.contains("thumb"));
        assert!(running_types.contains("encode"));
    }

    #[tokio::test]
    async fn success_callback_is_idempotent_and_does_not_clobber_child_written_status() {
        let repo = Arc::new(InMemoryRepository::new());
        let seeded = repo.seed(Job::new_pending("encode", 3, json!(null)));

        // Simulate the child having already written its own terminal
        // status: success callback must not overwrite it.
        let mut already_succeeded = seeded.clone();
        already_succeeded.status = JobStatus::Success;
        already_succeeded.status_text = "custom completion message".to_string();
        repo.save(&already_succeeded).await.unwrap();

        let spawner = Arc::new(ScriptedSpawner::new(vec![]));
        let supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(1),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        supervisor.success_callback(&seeded).await.unwrap();
        supervisor.success_callback(&seeded).await.unwrap();

        let job = repo.all_jobs().into_iter().next().unwrap();
        assert_eq!(job.status_text, "custom completion message");
    }

    #[tokio::test]
    async fn error_callback_after_success_leaves_status_success() {
        let repo = Arc::new(InMemoryRepository::new());
        let seeded = repo.seed(Job::new_pending("encode", 3, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![]));
        let supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(1),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        supervisor.success_callback(&seeded).await.unwrap();
        supervisor.error_callback(&seeded, 1).await.unwrap();

        let job = repo.all_jobs().into_iter().next().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn terminate_all_reaps_every_active_child_and_releases_slots() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed(Job::new_pending("encode", 3, json!(null)));
        repo.seed(Job::new_pending("encode", 3, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![
            FakeOutcome::NeverExits,
            FakeOutcome::NeverExits,
        ]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            slots(2),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        supervisor.tick().await.unwrap();
        assert_eq!(supervisor.active_child_count(), 2);

        supervisor.terminate_all(Duration::from_millis(10)).await;

        assert_eq!(supervisor.active_child_count(), 0);
        assert_eq!(supervisor.slots.free_count(), 2);
    }

    #[tokio::test]
    async fn empty_eligible_types_claims_nothing() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed(Job::new_pending("encode", 3, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![]));
        let mut supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            SlotPool::new(HashMap::new()),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        let outcome = supervisor.tick().await.unwrap();
        assert_eq!(outcome.claimed, 0);
    }

    /// A `Repository` whose `claim_one` always fails transiently; everything
    /// else delegates to an inner `InMemoryRepository`.
    struct FlakyClaimRepository {
        inner: InMemoryRepository,
    }

    #[async_trait]
    impl Repository for FlakyClaimRepository {
        async fn claim_one(
            &self,
            _eligible_types: &BTreeSet<String>,
            _claimer: &str,
        ) -> Result<Option<Job>, RepositoryError> {
            Err(RepositoryError::Transient(anyhow::anyhow!("connection reset")))
        }

        async fn reload(&self, job: &Job) -> Result<Job, RepositoryError> {
            self.inner.reload(job).await
        }

        async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
            self.inner.save(job).await
        }

        async fn insert(&self, job: &Job) -> Result<Job, RepositoryError> {
            self.inner.insert(job).await
        }

        async fn save_host(&self, host: &crate::host::Host) -> Result<(), RepositoryError> {
            self.inner.save_host(host).await
        }
    }

    #[tokio::test]
    async fn transient_claim_error_yields_zero_claims_instead_of_failing_the_tick() {
        let repo = Arc::new(FlakyClaimRepository {
            inner: InMemoryRepository::new(),
        });
        repo.inner.seed(Job::new_pending("encode", 3, json!(null)));

        let spawner = Arc::new(ScriptedSpawner::new(vec![]));
        let mut supervisor = Supervisor::new(
            repo,
            spawner,
            slots(1),
            SupervisorConfig::new("host-a", Duration::from_millis(1)),
            child_config(),
        );

        let outcome = supervisor
            .tick()
            .await
            .expect("a transient claim error must not fail the tick");
        assert_eq!(outcome.claimed, 0);
        assert_eq!(outcome.spawned, 0);
    }
}
