//! The `Host` model and the pluggable telemetry reporter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of host resource usage, produced by an injected
/// [`HostReporter`]. The core never interprets the contents; it is opaque
/// telemetry attached to the heartbeat write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disks: Vec<DiskUsage>,
    pub child_pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Periodic host/disk/memory collection stays external to the core; it is
/// consumed through this narrow interface so the Status Ticker can stay
/// agnostic to how telemetry is actually gathered.
pub trait HostReporter: Send + Sync {
    fn snapshot(&self) -> SystemSnapshot;
}

/// A reporter that always returns an empty snapshot, useful for tests and
/// for agents that don't want telemetry overhead.
#[derive(Debug, Default)]
pub struct NullReporter;

impl HostReporter for NullReporter {
    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::default()
    }
}

/// One record per agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub job_slots: HashMap<String, u32>,
    pub last_status_time: Option<DateTime<Utc>>,
    /// Monotonically increasing; lets readers detect a stalled heartbeat
    /// stream even when `last_status_time` looks recent due to clock skew.
    pub status_index: u64,
    pub status_payload: SystemSnapshot,
    /// Snapshot of in-flight counts at the last tick, reported alongside
    /// `job_slots` for observability even though capacity is declared once.
    pub in_flight_by_type: HashMap<String, u32>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, job_slots: HashMap<String, u32>) -> Self {
        Self {
            hostname: hostname.into(),
            job_slots,
            last_status_time: None,
            status_index: 0,
            status_payload: SystemSnapshot::default(),
            in_flight_by_type: HashMap::new(),
        }
    }

    /// Produce the next heartbeat record. Does not write anything itself;
    /// the caller (Status Ticker, via `Repository::save_host`) is
    /// responsible for persistence. `child_pids` overrides whatever the
    /// reporter itself filled in, since only the supervisor (not the
    /// reporter) knows which OS processes it is currently tracking.
    pub fn tick(
        &mut self,
        in_flight_by_type: HashMap<String, u32>,
        child_pids: Vec<u32>,
        reporter: &dyn HostReporter,
    ) {
        let mut payload = reporter.snapshot();
        payload.disks.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
        payload.child_pids = child_pids;
        self.status_payload = payload;
        self.status_index += 1;
        self.last_status_time = Some(Utc::now());
        self.in_flight_by_type = in_flight_by_type;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_increments_status_index_and_stamps_time() {
        let mut host = Host::new("host-a", HashMap::from([("encode".to_string(), 2)]));
        assert_eq!(host.status_index, 0);
        assert!(host.last_status_time.is_none());

        host.tick(HashMap::new(), Vec::new(), &NullReporter);

        assert_eq!(host.status_index, 1);
        assert!(host.last_status_time.is_some());

        host.tick(
            HashMap::from([("encode".to_string(), 1)]),
            vec![4242],
            &NullReporter,
        );
        assert_eq!(host.status_index, 2);
        assert_eq!(host.in_flight_by_type.get("encode"), Some(&1));
        assert_eq!(host.status_payload.child_pids, vec![4242]);
    }
}
