//! A periodic task, independent of the supervisor loop, that writes a
//! heartbeat at a fixed interval. Missed ticks don't queue; each tick just
//! writes whatever the latest snapshot is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::host::{Host, HostReporter};
use crate::repository::Repository;

/// Shared, read-mostly mirror of the supervisor's in-flight counters. The
/// supervisor writes it once per tick; the ticker only ever reads it, so a
/// plain mutexed map is enough; no need to share the slot pool itself.
pub type InFlightMirror = Arc<std::sync::Mutex<HashMap<String, u32>>>;

/// Same pattern as [`InFlightMirror`], for the active child OS pids the
/// heartbeat's `system_snapshot.child_pids` reports.
pub type ChildPidMirror = Arc<std::sync::Mutex<Vec<u32>>>;

/// Runs `update_status()` every `interval` until `cancel` fires. The ticker
/// owns no slot-pool state directly; it takes a read-only snapshot
/// function so it never contends with the supervisor for the same lock
/// longer than a clone.
pub struct StatusTicker {
    interval: Duration,
}

impl StatusTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn the ticker as a background task. Returns the join handle so
    /// the caller can await it during shutdown after cancelling the token;
    /// the ticker stops before children are terminated.
    pub fn spawn<R: Repository + 'static, H: HostReporter + 'static>(
        &self,
        host: Arc<Mutex<Host>>,
        repo: Arc<R>,
        reporter: Arc<H>,
        in_flight: InFlightMirror,
        child_pids: ChildPidMirror,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // tokio::time::interval fires immediately on the first tick, so
            // the first heartbeat happens right away rather than after a
            // full interval of silence.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("status ticker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = in_flight.lock().unwrap().clone();
                        let pids = child_pids.lock().unwrap().clone();
                        let mut guard = host.lock().await;
                        guard.tick(snapshot, pids, reporter.as_ref());
                        if let Err(e) = repo.save_host(&guard).await {
                            warn!(error = %e, "status ticker heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}
