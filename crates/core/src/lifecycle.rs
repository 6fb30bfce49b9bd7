//! Agent lifecycle: setup (connect, register host, start tickers), run
//! (drive the supervisor loop), shutdown (stop tickers, terminate children,
//! join).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::child::{ChildProcessConfig, ProcessSpawner};
use crate::host::{Host, HostReporter};
use crate::repository::Repository;
use crate::slots::SlotPool;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::ticker::{ChildPidMirror, InFlightMirror, StatusTicker};

pub struct AgentConfig {
    pub hostname: String,
    pub job_slots: HashMap<String, u32>,
    pub loop_duration: Duration,
    pub update_interval: Duration,
    pub child_config: ChildProcessConfig,
}

/// Ties together the Supervisor and the Status Ticker behind a setup/run/
/// shutdown sequence. Generic over the repository, process spawner, and
/// host reporter so the agent binary can wire real implementations while
/// tests wire fakes.
pub struct Agent<R: Repository + 'static, P: ProcessSpawner + 'static, H: HostReporter + 'static> {
    repo: Arc<R>,
    host: Arc<Mutex<Host>>,
    in_flight_mirror: InFlightMirror,
    child_pid_mirror: ChildPidMirror,
    supervisor: Supervisor<R, P>,
    ticker_cancel: CancellationToken,
    ticker_handle: Option<tokio::task::JoinHandle<()>>,
    reporter: Arc<H>,
}

impl<R: Repository, P: ProcessSpawner, H: HostReporter> Agent<R, P, H> {
    /// Connect (the caller already built `repo`), resolve hostname,
    /// register Host with declared slots, start the Status Ticker,
    /// initialize an empty child table and full slot pool.
    pub async fn setup(
        repo: Arc<R>,
        spawner: Arc<P>,
        reporter: Arc<H>,
        config: AgentConfig,
    ) -> anyhow::Result<Self> {
        let host = Host::new(config.hostname.clone(), config.job_slots.clone());
        repo.save_host(&host).await?;
        info!(hostname = %config.hostname, slots = ?config.job_slots, "agent registered");

        let supervisor = Supervisor::new(
            repo.clone(),
            spawner,
            SlotPool::new(config.job_slots.clone()),
            SupervisorConfig::new(config.hostname.clone(), config.loop_duration),
            config.child_config,
        );

        let host = Arc::new(Mutex::new(host));
        let in_flight_mirror: InFlightMirror = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let child_pid_mirror: ChildPidMirror = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ticker = StatusTicker::new(config.update_interval);
        let ticker_cancel = CancellationToken::new();
        let ticker_handle = Some(ticker.spawn(
            host.clone(),
            repo.clone(),
            reporter.clone(),
            in_flight_mirror.clone(),
            child_pid_mirror.clone(),
            ticker_cancel.clone(),
        ));

        Ok(Self {
            repo,
            host,
            in_flight_mirror,
            child_pid_mirror,
            supervisor,
            ticker_cancel,
            ticker_handle,
            reporter,
        })
    }

    /// Drives a single iteration of the supervisor loop.
    pub async fn run_tick(&mut self) -> anyhow::Result<crate::supervisor::TickOutcome> {
        let outcome = self.supervisor.tick().await?;
        *self.in_flight_mirror.lock().unwrap() = self.supervisor.in_flight_by_type();
        *self.child_pid_mirror.lock().unwrap() = self.supervisor.child_pids();
        Ok(outcome)
    }

    /// Drives `run_tick` until `shutdown` is cancelled, sleeping
    /// `loop_duration` between ticks when no throttle already occurred.
    pub async fn run_until_shutdown(
        &mut self,
        loop_duration: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.run_tick().await?;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(loop_duration) => {}
            }
        }
        Ok(())
    }

    /// Stop the ticker first, then terminate children with a bounded grace
    /// period. Does not attempt to flush child jobs' statuses; they remain
    /// `running` for an external reconciler to find on a hard crash.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.ticker_cancel.cancel();
        if let Some(handle) = self.ticker_handle.take() {
            let _ = handle.await;
        }
        info!("status ticker stopped, terminating active children");
        self.supervisor
            .terminate_all(crate::supervisor::DEFAULT_GRACE_PERIOD)
            .await;
        info!("agent shutdown complete");
        Ok(())
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn host_reporter(&self) -> &Arc<H> {
        &self.reporter
    }
}
