//! Child-process supervision primitives.
//!
//! A fork-based design can bind success/error callbacks as attributes on
//! the process object itself. That doesn't translate to a fresh-process
//! model: here, a [`ChildHandle`] is a plain struct owned by the
//! [`crate::supervisor::Supervisor`], carrying only what's needed to
//! observe and react to the child's outcome. No callback closures are
//! stored on the handle; the supervisor itself invokes the success/error
//! logic once it has observed an exit code.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::job::Job;

/// Everything the supervisor needs to track about one spawned child between
/// the tick it was spawned on and the tick it's reaped on.
pub struct ChildHandle {
    pub slot_number: u32,
    pub job: Job,
    pub start_time: std::time::Instant,
    pub child: Box<dyn SpawnedChild>,
}

impl ChildHandle {
    /// `Process-<NN>-<uuid>`, the process name used for log and `ps`
    /// correlation.
    pub fn process_name(&self) -> String {
        format!("Process-{:02}-{}", self.slot_number, self.job.uuid)
    }

    pub fn timed_out(&self, now: std::time::Instant) -> bool {
        match self.job.timeout {
            Some(secs) if secs > 0 => now.duration_since(self.start_time) > Duration::from_secs(secs as u64),
            _ => false,
        }
    }
}

/// Abstracts over an OS child handle so the supervisor's reap/timeout logic
/// is unit-testable without actually forking processes. [`TokioChild`]
/// implements this over a real `tokio::process::Child`; tests use a fake
/// that can be told to "exit" or "hang" on command.
#[async_trait]
pub trait SpawnedChild: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check: `Ok(Some(code))` if the child has exited,
    /// `Ok(None)` if still running.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    /// Send a termination signal, then wait up to `grace` for the process
    /// to actually exit. Treated as failure regardless of the eventual
    /// exit code.
    async fn terminate(&mut self, grace: Duration) -> io::Result<()>;
}

pub struct TokioChild {
    inner: tokio::process::Child,
}

#[async_trait]
impl SpawnedChild for TokioChild {
    fn id(&self) -> Option<u32> {
        self.inner.id()
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self.inner.try_wait()?.map(|status| status.code().unwrap_or(1)))
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        self.inner.start_kill()?;
        let _ = tokio::time::timeout(grace, self.inner.wait()).await;
        Ok(())
    }
}

/// Parameters passed to a spawned child, deliberately narrow: just
/// `(job_id, slot_number, connection_config)`. The child re-opens its own
/// repository connection and reloads the job; no parent state or service
/// object crosses the process boundary.
#[derive(Debug, Clone)]
pub struct ChildProcessConfig {
    /// Path to the agent binary, re-exec'd with the hidden `run-job`
    /// subcommand.
    pub exe_path: std::path::PathBuf,
    pub config_path: std::path::PathBuf,
    pub log_file: Option<std::path::PathBuf>,
}

/// Spawns the OS child process that will execute one claimed job.
/// Implemented once against `tokio::process::Command` in this crate (child
/// spawning is core behavior, not an external collaborator); tests inject a
/// fake that never touches the OS.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(
        &self,
        job: &Job,
        slot_number: u32,
        config: &ChildProcessConfig,
    ) -> io::Result<Box<dyn SpawnedChild>>;
}

/// Spawns `<exe_path> run-job --job-id <id> --slot <n> --config <path>`,
/// redirecting the child's log output to a slot-specific file derived from
/// `log_file` when one is configured (`<base>.process-<NN>.<ext>`).
pub struct TokioProcessSpawner;

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(
        &self,
        job: &Job,
        slot_number: u32,
        config: &ChildProcessConfig,
    ) -> io::Result<Box<dyn SpawnedChild>> {
        let job_id = job.id.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot spawn a child for an unclaimed job",
            )
        })?;

        let mut cmd = Command::new(&config.exe_path);
        cmd.arg("run-job")
            .arg("--job-id")
            .arg(job_id.to_string())
            .arg("--slot")
            .arg(slot_number.to_string())
            .arg("--config")
            .arg(&config.config_path)
            .kill_on_drop(true);

        // The child derives its own per-slot log path from the config file
        // it reloads plus `--slot`; no need to additionally pass it down.
        let inner = cmd.spawn()?;
        Ok(Box::new(TokioChild { inner }))
    }
}

/// `<base>.process-<NN>.<ext>`, derived from the configured base path.
pub fn per_slot_log_path(
    base: Option<&std::path::Path>,
    slot_number: u32,
) -> Option<std::path::PathBuf> {
    let base = base?;
    let stem = base.file_stem()?.to_string_lossy().into_owned();
    let ext = base.extension().map(|e| e.to_string_lossy().into_owned());
    let mut name = format!("{stem}.process-{slot_number:02}");
    if let Some(ext) = ext {
        name.push('.');
        name.push_str(&ext);
    }
    Some(base.with_file_name(name))
}

#[cfg(test)]
pub mod testing {
    //! A fake [`SpawnedChild`] for supervisor unit tests: programmable exit
    //! behavior without spawning a real OS process.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub enum FakeOutcome {
        ExitAfter { polls: u32, code: i32 },
        NeverExits,
    }

    pub struct FakeChild {
        outcome: FakeOutcome,
        polls: u32,
        terminated: Arc<AtomicBool>,
    }

    impl FakeChild {
        pub fn new(outcome: FakeOutcome) -> Self {
            Self {
                outcome,
                polls: 0,
                terminated: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn was_terminated(&self) -> Arc<AtomicBool> {
            self.terminated.clone()
        }
    }

    #[async_trait]
    impl SpawnedChild for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
            self.polls += 1;
            match self.outcome {
                FakeOutcome::ExitAfter { polls, code } if self.polls >= polls => Ok(Some(code)),
                _ => Ok(None),
            }
        }

        async fn terminate(&mut self, _grace: Duration) -> io::Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn per_slot_log_path_inserts_process_number_before_extension() {
        let base = std::path::Path::new("/var/log/agent.log");
        let derived = super::per_slot_log_path(Some(base), 3).unwrap();
        assert_eq!(derived, std::path::Path::new("/var/log/agent.process-03.log"));
    }

    #[test]
    fn per_slot_log_path_is_none_without_a_base() {
        assert!(super::per_slot_log_path(None, 1).is_none());
    }
}
