//! Launch configuration for hypervisor processes.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default kernel command line for sandbox guests.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Everything needed to start one hypervisor process for one sandbox.
///
/// Paths in [`kernel_path`](Self::kernel_path) and the drives are the paths
/// the hypervisor sees *after* the bind mounts in [`mounts`](Self::mounts)
/// have been applied inside its private mount namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Identifier of the sandbox this process belongs to
    pub vm_id: String,
    /// Number of virtual CPUs (1-32)
    pub vcpu_count: u8,
    /// Memory size in MiB (128-32768)
    pub memory_mib: u32,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Root filesystem drive
    pub root_drive: DriveConfig,
    /// Additional drives (optional)
    pub extra_drives: Vec<DriveConfig>,
    /// Network configuration (optional)
    pub network: Option<NetworkConfig>,
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Path of the Firecracker API socket
    pub socket_path: PathBuf,
    /// Network namespace the process runs in
    pub netns: String,
    /// Bind mounts applied in the private mount namespace before exec
    pub mounts: Vec<BindMount>,
    /// `cgroup.procs` file the process moves itself into before exec
    pub cgroup_procs: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            vm_id: String::new(),
            vcpu_count: 2,
            memory_mib: 512,
            kernel_path: PathBuf::from("/var/lib/skerry/kernels/vmlinux"),
            boot_args: DEFAULT_BOOT_ARGS.into(),
            root_drive: DriveConfig::default(),
            extra_drives: Vec::new(),
            network: None,
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            socket_path: PathBuf::new(),
            netns: String::new(),
            mounts: Vec::new(),
            cgroup_procs: None,
        }
    }
}

impl LaunchConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.vm_id.is_empty() {
            return Err(VmError::Config("vm_id is required".into()));
        }

        // Firecracker supports 1-32 vCPUs
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }

        if self.memory_mib < 128 {
            return Err(VmError::Config(format!(
                "memory_mib must be at least 128, got {}",
                self.memory_mib
            )));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(VmError::Config("socket_path is required".into()));
        }

        if self.netns.is_empty() {
            return Err(VmError::Config("netns is required".into()));
        }

        let mut drive_ids = vec![self.root_drive.drive_id.clone()];
        for extra in &self.extra_drives {
            if drive_ids.contains(&extra.drive_id) {
                return Err(VmError::Config(format!(
                    "duplicate drive_id: {}",
                    extra.drive_id
                )));
            }
            drive_ids.push(extra.drive_id.clone());
        }

        Ok(())
    }
}

/// Configuration for a block device (drive).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image as seen by the hypervisor
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::new(),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Guest network interface backed by a tap device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Interface id inside Firecracker
    pub iface_id: String,
    /// Tap device name in the process' network namespace
    pub host_dev_name: String,
    /// Optional fixed guest MAC address
    pub guest_mac: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            iface_id: "eth0".into(),
            host_dev_name: "tap0".into(),
            guest_mac: None,
        }
    }
}

/// A bind mount performed in the launcher's private mount namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LaunchConfig {
        LaunchConfig {
            vm_id: "sbx-1".into(),
            socket_path: PathBuf::from("/tmp/sbx-1.sock"),
            netns: "sbx-1-0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_netns() {
        let config = LaunchConfig {
            netns: String::new(),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(VmError::Config(_))));
    }

    #[test]
    fn test_vcpu_bounds() {
        let config = LaunchConfig {
            vcpu_count: 33,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_drive_ids() {
        let mut config = valid();
        config.extra_drives.push(DriveConfig {
            drive_id: "rootfs".into(),
            is_root_device: false,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
