//! Host and per-sandbox configuration types.

use crate::address::{capacity, Ipv4Cidr, DEFAULT_SUBNET};
use crate::error::CoreError;
use crate::layout::validate_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// vCPU and memory limits for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// vCPU count (default: 2).
    pub vcpu_count: u8,
    /// Guest memory in MiB (default: 512).
    pub memory_mib: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            memory_mib: 512,
        }
    }
}

impl ResourceLimits {
    /// Validate against what the hypervisor accepts.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(CoreError::Validation(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }
        if self.memory_mib < 128 {
            return Err(CoreError::Validation(format!(
                "memory_mib must be >= 128, got {}",
                self.memory_mib
            )));
        }
        Ok(())
    }
}

/// Host-wide settings shared by every sandbox.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root of templates, instances, sockets and metrics targets.
    pub data_root: PathBuf,
    /// cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Parent group for sandbox cgroups, relative to `cgroup_root`.
    pub cgroup_name: String,
    /// Subnet carved into per-slot veth blocks and host-cloned addresses.
    pub subnet: Ipv4Cidr,
    /// Host interface sandbox traffic is masqueraded out of.
    pub uplink: String,
    /// Hypervisor binary.
    pub hypervisor_path: PathBuf,
    /// Host kernel image, bind-mounted into every sandbox.
    pub kernel_path: PathBuf,
    /// Guest kernel command line.
    pub boot_args: String,
    /// Hosts-format file mirroring sandbox DNS records, if any.
    pub dns_hosts_file: Option<PathBuf>,
    /// Domain appended to sandbox ids in the hosts file.
    pub dns_domain: String,
    /// Guest metrics exporter port; no target file is written when unset.
    pub metrics_port: Option<u16>,
    /// Limits used when a request does not carry its own.
    pub default_limits: ResourceLimits,
    /// Deadline for a create when the request does not set one.
    pub create_timeout: Duration,
    /// How long delete waits for the hypervisor to exit before killing it again.
    pub stop_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/skerry"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_name: "skerry".into(),
            subnet: DEFAULT_SUBNET,
            uplink: "eth0".into(),
            hypervisor_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/skerry/kernels/vmlinux"),
            boot_args: skerry_vm::DEFAULT_BOOT_ARGS.into(),
            dns_hosts_file: None,
            dns_domain: "sandbox.internal".into(),
            metrics_port: None,
            default_limits: ResourceLimits::default(),
            create_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl HostConfig {
    /// Create a new config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Number of sandboxes the subnet can address.
    pub fn slot_capacity(&self) -> Result<u32, CoreError> {
        capacity(&self.subnet)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.data_root.as_os_str().is_empty() {
            return Err(CoreError::Validation("data_root is required".into()));
        }
        if self.cgroup_name.is_empty() || self.cgroup_name.starts_with('/') {
            return Err(CoreError::Validation(
                "cgroup_name must be a non-empty relative path".into(),
            ));
        }
        if self.uplink.is_empty() {
            return Err(CoreError::Validation("uplink interface is required".into()));
        }
        if self.hypervisor_path.as_os_str().is_empty() {
            return Err(CoreError::Validation("hypervisor_path is required".into()));
        }
        if self.kernel_path.as_os_str().is_empty() {
            return Err(CoreError::Validation("kernel_path is required".into()));
        }
        self.slot_capacity()?;
        self.default_limits.validate()?;
        if self.create_timeout.is_zero() {
            return Err(CoreError::Validation("create_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for HostConfig.
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_root = path.into();
        self
    }

    pub fn cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cgroup_root = path.into();
        self
    }

    pub fn cgroup_name(mut self, name: impl Into<String>) -> Self {
        self.config.cgroup_name = name.into();
        self
    }

    pub fn subnet(mut self, subnet: Ipv4Cidr) -> Self {
        self.config.subnet = subnet;
        self
    }

    pub fn uplink(mut self, iface: impl Into<String>) -> Self {
        self.config.uplink = iface.into();
        self
    }

    pub fn hypervisor(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.hypervisor_path = path.into();
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Mirror DNS records into a hosts-format file.
    pub fn dns_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dns_hosts_file = Some(path.into());
        self
    }

    pub fn dns_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.dns_domain = domain.into();
        self
    }

    pub fn metrics_port(mut self, port: u16) -> Self {
        self.config.metrics_port = Some(port);
        self
    }

    pub fn default_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.default_limits = limits;
        self
    }

    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.config.create_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<HostConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A request to create one sandbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxSpec {
    pub sandbox_id: String,
    pub template_id: String,
    /// Share the base image through a hard link and clone only the writable delta.
    pub overlay: bool,
    /// Falls back to the host default when unset.
    pub limits: Option<ResourceLimits>,
    pub metadata: HashMap<String, String>,
    /// Falls back to the host create timeout when unset.
    pub timeout: Option<Duration>,
}

impl SandboxSpec {
    /// Create a new spec builder.
    pub fn builder() -> SandboxSpecBuilder {
        SandboxSpecBuilder::default()
    }

    /// Validate ids and limits.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_id("sandbox_id", &self.sandbox_id)?;
        validate_id("template_id", &self.template_id)?;
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(CoreError::Validation("timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for SandboxSpec.
#[derive(Debug, Default)]
pub struct SandboxSpecBuilder {
    spec: SandboxSpec,
}

impl SandboxSpecBuilder {
    pub fn sandbox_id(mut self, id: impl Into<String>) -> Self {
        self.spec.sandbox_id = id.into();
        self
    }

    pub fn template_id(mut self, id: impl Into<String>) -> Self {
        self.spec.template_id = id.into();
        self
    }

    pub fn overlay(mut self, overlay: bool) -> Self {
        self.spec.overlay = overlay;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.spec.limits = Some(limits);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Build the spec, validating ids and limits.
    pub fn build(self) -> Result<SandboxSpec, CoreError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
