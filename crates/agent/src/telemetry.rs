//! Default [`HostReporter`] implementation backed by `sysinfo`.
//!
//! The host-telemetry collector (CPU percent, memory, disk partitions,
//! child process list) stays external to the core. `jobagent-core` stays
//! decoupled from any concrete telemetry library by depending only on the
//! [`HostReporter`] trait; this crate supplies the default implementation
//! the binary actually wires up.

use std::sync::Mutex;

use jobagent_core::host::{DiskUsage, HostReporter, SystemSnapshot};
use sysinfo::{Disks, System};

/// Refreshes and snapshots host CPU/memory/disk usage on each call. Wraps
/// the underlying `System` in a mutex since `sysinfo::System::refresh_*` is
/// `&mut self` but [`HostReporter::snapshot`] only offers `&self`. The
/// ticker calls this at most once per heartbeat interval, so contention is
/// not a concern.
pub struct SysinfoReporter {
    system: Mutex<System>,
}

impl SysinfoReporter {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }

}

impl Default for SysinfoReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostReporter for SysinfoReporter {
    fn snapshot(&self) -> SystemSnapshot {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = if system.cpus().is_empty() {
            0.0
        } else {
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len() as f32
        };

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|d| DiskUsage {
                mount_point: d.mount_point().to_string_lossy().into_owned(),
                used_bytes: d.total_space().saturating_sub(d.available_space()),
                total_bytes: d.total_space(),
            })
            .collect();

        SystemSnapshot {
            cpu_percent,
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            disks,
            child_pids: Vec::new(),
        }
    }
}
