//! Builder pattern for ergonomic launch configuration.

use crate::config::{BindMount, DriveConfig, LaunchConfig, NetworkConfig};
use crate::error::Result;
use crate::machine::{Hypervisor, VmProcess};
use std::path::PathBuf;

/// Fluent builder for [`LaunchConfig`].
///
/// # Example
///
/// ```no_run
/// use skerry_vm::{Firecracker, LaunchBuilder};
///
/// # async fn example() -> skerry_vm::Result<()> {
/// let process = LaunchBuilder::new("sbx-1")
///     .vcpus(2)
///     .memory_mib(512)
///     .netns("sbx-1-0")
///     .socket("/var/lib/skerry/sockets/sbx-1.sock")
///     .kernel("/var/lib/skerry/templates/base/run/vmlinux")
///     .rootfs("/var/lib/skerry/templates/base/run/rootfs.ext4")
///     .with_network("tap0")
///     .launch(&Firecracker::default())
///     .await?;
/// process.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LaunchBuilder {
    config: LaunchConfig,
}

impl LaunchBuilder {
    /// Create a new builder for the given sandbox id with default configuration.
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            config: LaunchConfig {
                vm_id: vm_id.into(),
                ..Default::default()
            },
        }
    }

    /// Set the number of virtual CPUs (1-32).
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the kernel boot arguments.
    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Set the path to the root filesystem image.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    /// Set the root drive as read-only.
    pub fn rootfs_read_only(mut self) -> Self {
        self.config.root_drive.is_read_only = true;
        self
    }

    /// Add an extra writable drive.
    pub fn with_drive(mut self, drive_id: &str, path: impl Into<PathBuf>) -> Self {
        self.config.extra_drives.push(DriveConfig {
            drive_id: drive_id.to_string(),
            path_on_host: path.into(),
            is_root_device: false,
            is_read_only: false,
        });
        self
    }

    /// Configure the guest network interface with the given tap device.
    pub fn with_network(mut self, tap_dev: &str) -> Self {
        self.config.network = Some(NetworkConfig {
            host_dev_name: tap_dev.to_string(),
            ..Default::default()
        });
        self
    }

    /// Set the path to the Firecracker binary.
    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Set the API socket path.
    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set the network namespace the process is started in.
    pub fn netns(mut self, name: impl Into<String>) -> Self {
        self.config.netns = name.into();
        self
    }

    /// Bind-mount `source` onto `target` before the hypervisor starts.
    pub fn bind_mount(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.config.mounts.push(BindMount {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Move the process into the cgroup owning this `cgroup.procs` file.
    pub fn cgroup_procs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cgroup_procs = Some(path.into());
        self
    }

    /// Build and return the configuration without launching anything.
    pub fn build_config(self) -> LaunchConfig {
        self.config
    }

    /// Launch the process with the given hypervisor implementation.
    ///
    /// # Errors
    /// Returns an error if validation, spawn or API configuration fails.
    pub async fn launch(self, hypervisor: &dyn Hypervisor) -> Result<Box<dyn VmProcess>> {
        hypervisor.launch(self.config).await
    }
}
