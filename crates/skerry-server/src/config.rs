//! Configuration for the skerry daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use skerry_core::{CoreError, HostConfig, Ipv4Cidr, ResourceLimits};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the skerry server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root of templates, instances, sockets and metrics targets.
    pub data_root: PathBuf,

    /// cgroup v2 mount point.
    pub cgroup_root: PathBuf,

    /// Parent cgroup for sandboxes.
    pub cgroup_name: String,

    /// Subnet for veth blocks and host-cloned addresses.
    pub subnet: Ipv4Cidr,

    /// Host interface sandbox traffic leaves through.
    pub uplink: String,

    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,

    /// Path to the guest kernel.
    pub kernel_path: PathBuf,

    /// Guest kernel command line.
    pub boot_args: String,

    /// Hosts file mirroring sandbox DNS records.
    pub dns_hosts_file: Option<PathBuf>,

    /// Domain for sandbox host names.
    pub dns_domain: String,

    /// Guest metrics exporter port (no targets written when unset).
    pub metrics_port: Option<u16>,

    /// Default vCPU count (default: 2).
    pub vcpu_count: u8,

    /// Default memory in MiB (default: 512).
    pub memory_mib: u32,

    /// Create deadline in seconds (default: 60).
    pub create_timeout_secs: u64,

    /// Seconds to wait for a stopped hypervisor (default: 10).
    pub stop_timeout_secs: u64,

    /// Kill orphans found at startup instead of only fencing their slots.
    pub purge_orphans: bool,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("kernel file not found: {0}")]
    MissingKernel(PathBuf),

    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("data root not found: {0}")]
    MissingDataRoot(PathBuf),

    #[error("cgroup root not found: {0}")]
    MissingCgroupRoot(PathBuf),

    #[error(transparent)]
    Host(#[from] CoreError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        let host = HostConfig::default();
        let limits = ResourceLimits::default();
        Self {
            data_root: host.data_root,
            cgroup_root: host.cgroup_root,
            cgroup_name: host.cgroup_name,
            subnet: host.subnet,
            uplink: host.uplink,
            firecracker_path: host.hypervisor_path,
            kernel_path: host.kernel_path,
            boot_args: host.boot_args,
            dns_hosts_file: None,
            dns_domain: host.dns_domain,
            metrics_port: None,
            vcpu_count: limits.vcpu_count,
            memory_mib: limits.memory_mib,
            create_timeout_secs: host.create_timeout.as_secs(),
            stop_timeout_secs: host.stop_timeout.as_secs(),
            purge_orphans: false,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

fn flag(value: &str) -> bool {
    value != "false" && value != "0"
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SKERRY_DATA_ROOT` | `/var/lib/skerry` |
    /// | `SKERRY_CGROUP_ROOT` | `/sys/fs/cgroup` |
    /// | `SKERRY_CGROUP_NAME` | `skerry` |
    /// | `SKERRY_SUBNET` | `10.140.0.0/16` |
    /// | `SKERRY_UPLINK` | `eth0` |
    /// | `SKERRY_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `SKERRY_KERNEL` | `/var/lib/skerry/kernels/vmlinux` |
    /// | `SKERRY_BOOT_ARGS` | `console=ttyS0 reboot=k panic=1 pci=off` |
    /// | `SKERRY_DNS_HOSTS_FILE` | unset |
    /// | `SKERRY_DNS_DOMAIN` | `sandbox.internal` |
    /// | `SKERRY_METRICS_PORT` | unset |
    /// | `SKERRY_VCPUS` | `2` |
    /// | `SKERRY_MEMORY_MIB` | `512` |
    /// | `SKERRY_CREATE_TIMEOUT_SECS` | `60` |
    /// | `SKERRY_STOP_TIMEOUT_SECS` | `10` |
    /// | `SKERRY_PURGE_ORPHANS` | `false` |
    /// | `SKERRY_HTTP_HOST` | `127.0.0.1` |
    /// | `SKERRY_HTTP_PORT` | `8080` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = parsed(&lookup, "SKERRY_HTTP_HOST").unwrap_or(default.http_addr.ip());
        let http_port: u16 = parsed(&lookup, "SKERRY_HTTP_PORT").unwrap_or(default.http_addr.port());

        Self {
            data_root: lookup("SKERRY_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.data_root),
            cgroup_root: lookup("SKERRY_CGROUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.cgroup_root),
            cgroup_name: lookup("SKERRY_CGROUP_NAME").unwrap_or(default.cgroup_name),
            subnet: parsed(&lookup, "SKERRY_SUBNET").unwrap_or(default.subnet),
            uplink: lookup("SKERRY_UPLINK").unwrap_or(default.uplink),
            firecracker_path: lookup("SKERRY_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.firecracker_path),
            kernel_path: lookup("SKERRY_KERNEL")
                .map(PathBuf::from)
                .unwrap_or(default.kernel_path),
            boot_args: lookup("SKERRY_BOOT_ARGS").unwrap_or(default.boot_args),
            dns_hosts_file: lookup("SKERRY_DNS_HOSTS_FILE").map(PathBuf::from),
            dns_domain: lookup("SKERRY_DNS_DOMAIN").unwrap_or(default.dns_domain),
            metrics_port: parsed(&lookup, "SKERRY_METRICS_PORT"),
            vcpu_count: parsed(&lookup, "SKERRY_VCPUS").unwrap_or(default.vcpu_count),
            memory_mib: parsed(&lookup, "SKERRY_MEMORY_MIB").unwrap_or(default.memory_mib),
            create_timeout_secs: parsed(&lookup, "SKERRY_CREATE_TIMEOUT_SECS")
                .unwrap_or(default.create_timeout_secs),
            stop_timeout_secs: parsed(&lookup, "SKERRY_STOP_TIMEOUT_SECS")
                .unwrap_or(default.stop_timeout_secs),
            purge_orphans: lookup("SKERRY_PURGE_ORPHANS")
                .map(|v| flag(&v))
                .unwrap_or(default.purge_orphans),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }

    /// The library-level host configuration.
    pub fn host_config(&self) -> Result<HostConfig, ConfigError> {
        let mut builder = HostConfig::builder()
            .data_root(&self.data_root)
            .cgroup_root(&self.cgroup_root)
            .cgroup_name(&self.cgroup_name)
            .subnet(self.subnet)
            .uplink(&self.uplink)
            .hypervisor(&self.firecracker_path)
            .kernel(&self.kernel_path)
            .boot_args(&self.boot_args)
            .dns_domain(&self.dns_domain)
            .default_limits(ResourceLimits {
                vcpu_count: self.vcpu_count,
                memory_mib: self.memory_mib,
            })
            .create_timeout(Duration::from_secs(self.create_timeout_secs))
            .stop_timeout(Duration::from_secs(self.stop_timeout_secs));
        if let Some(path) = &self.dns_hosts_file {
            builder = builder.dns_hosts_file(path);
        }
        if let Some(port) = self.metrics_port {
            builder = builder.metrics_port(port);
        }
        Ok(builder.build()?)
    }

    /// Validate that configured paths exist and the host settings are sane.
    ///
    /// Call this at startup to get clear error messages about missing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.host_config()?;

        if !self.data_root.is_dir() {
            return Err(ConfigError::MissingDataRoot(self.data_root.clone()));
        }

        if !self.cgroup_root.is_dir() {
            return Err(ConfigError::MissingCgroupRoot(self.cgroup_root.clone()));
        }

        if !self.kernel_path.exists() {
            return Err(ConfigError::MissingKernel(self.kernel_path.clone()));
        }

        if !self.firecracker_path.exists() {
            return Err(ConfigError::MissingFirecracker(
                self.firecracker_path.clone(),
            ));
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.data_root, PathBuf::from("/var/lib/skerry"));
        assert_eq!(config.subnet.to_string(), "10.140.0.0/16");
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.memory_mib, 512);
        assert!(!config.purge_orphans);
        assert_eq!(config.http_addr.port(), 8080);
    }

    #[test]
    fn test_from_lookup_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        let default = ServerConfig::default();
        assert_eq!(config.data_root, default.data_root);
        assert_eq!(config.firecracker_path, default.firecracker_path);
        assert_eq!(config.http_addr, default.http_addr);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("SKERRY_DATA_ROOT", "/srv/skerry"),
            ("SKERRY_SUBNET", "172.20.0.0/20"),
            ("SKERRY_METRICS_PORT", "9100"),
            ("SKERRY_VCPUS", "4"),
            ("SKERRY_PURGE_ORPHANS", "1"),
            ("SKERRY_HTTP_HOST", "0.0.0.0"),
            ("SKERRY_HTTP_PORT", "9000"),
        ]));
        assert_eq!(config.data_root, PathBuf::from("/srv/skerry"));
        assert_eq!(config.subnet.prefix(), 20);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.vcpu_count, 4);
        assert!(config.purge_orphans);
        assert_eq!(config.http_addr.to_string(), "0.0.0.0:9000");

        let host = config.host_config().unwrap();
        assert_eq!(host.slot_capacity().unwrap(), 512);
        assert_eq!(host.metrics_port, Some(9100));
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("SKERRY_SUBNET", "not-a-subnet"),
            ("SKERRY_HTTP_PORT", "eighty"),
            ("SKERRY_PURGE_ORPHANS", "false"),
        ]));
        assert_eq!(config.subnet, ServerConfig::default().subnet);
        assert_eq!(config.http_addr.port(), 8080);
        assert!(!config.purge_orphans);
    }

    #[test]
    fn test_validate_reports_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            data_root: tmp.path().to_path_buf(),
            cgroup_root: tmp.path().to_path_buf(),
            kernel_path: tmp.path().join("vmlinux"),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingKernel(_))));

        std::fs::write(&config.kernel_path, b"").unwrap();
        config.firecracker_path = tmp.path().join("firecracker");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingFirecracker(_))
        ));

        config.vcpu_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Host(_))));
    }
}
