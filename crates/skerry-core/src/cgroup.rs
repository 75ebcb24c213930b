//! Per-sandbox cgroup v2 directory.
//!
//! The hypervisor attaches itself by writing its pid to `cgroup.procs` from
//! the launcher script, so this module only creates the group, writes the
//! limits and removes it again.
//!
//! When the root is not a cgroup2 mount (tests, dry runs) the group is an
//! ordinary directory and is removed recursively.

use crate::config::ResourceLimits;
use crate::error::{CoreError, Result};
use crate::retry::{retry_with_schedule, CGROUP_REMOVE_SCHEDULE};
use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Memory allowed on top of guest RAM for the hypervisor itself.
pub const MEMORY_OVERHEAD_MIB: u64 = 128;
/// `cpu.max` period in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// `memory.max` value in bytes.
pub fn memory_max(limits: &ResourceLimits) -> u64 {
    (limits.memory_mib as u64 + MEMORY_OVERHEAD_MIB) * 1024 * 1024
}

/// `cpu.max` value: one full period of quota per vCPU.
pub fn cpu_max(limits: &ResourceLimits) -> String {
    format!("{} {}", limits.vcpu_count as u64 * CPU_PERIOD_US, CPU_PERIOD_US)
}

/// Create the cgroup directory.
pub async fn create(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CoreError::path("create cgroup", path, e))
}

/// Write `memory.max` and `cpu.max`.
pub async fn apply_limits(path: &Path, limits: &ResourceLimits) -> Result<()> {
    let memory = path.join("memory.max");
    tokio::fs::write(&memory, memory_max(limits).to_string())
        .await
        .map_err(|e| CoreError::path("write", &memory, e))?;

    let cpu = path.join("cpu.max");
    tokio::fs::write(&cpu, cpu_max(limits))
        .await
        .map_err(|e| CoreError::path("write", &cpu, e))?;

    tracing::trace!(path = %path.display(), vcpus = limits.vcpu_count, memory_mib = limits.memory_mib, "Cgroup limits applied");
    Ok(())
}

/// Remove the cgroup, retrying while the kernel still accounts the dead
/// process against it. A missing group counts as removed.
pub async fn remove(path: &Path) -> Result<()> {
    remove_with_schedule(path, &CGROUP_REMOVE_SCHEDULE).await
}

fn on_cgroupfs(path: &Path) -> bool {
    statfs(path)
        .map(|fs| fs.filesystem_type() == CGROUP2_SUPER_MAGIC)
        .unwrap_or(true)
}

async fn remove_with_schedule(path: &Path, schedule: &[Duration]) -> Result<()> {
    retry_with_schedule(schedule, |_| async move {
        let removed = if on_cgroupfs(path) {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_dir_all(path).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::path("remove cgroup", path, e)),
        }
    })
    .await
}
