//! Host-wide resources shared by every sandbox.

use crate::best_effort::BestEffort;
use crate::cgroup;
use crate::config::HostConfig;
use crate::dns::DnsRegistry;
use crate::error::Result;
use crate::fs::FilesystemProvisioner;
use crate::layout::{ResourceLayout, SandboxIdentity};
use crate::network::{HostNetwork, NetworkEnv, NetworkWiring};
use crate::slots::SlotPool;
use std::sync::Arc;

/// Configuration plus the subsystems that act on the host.
#[derive(Debug)]
pub struct HostResources {
    config: HostConfig,
    network: NetworkWiring,
    fs: FilesystemProvisioner,
    slots: SlotPool,
}

/// Which pieces of a sandbox to release.
#[derive(Debug, Clone, Copy)]
pub struct Release<'a> {
    pub layout: &'a ResourceLayout,
    /// Tear down this network, if it was (or may have been) set up.
    pub network: Option<&'a NetworkEnv>,
    /// Remove the instance tree, socket and metrics target.
    pub files: bool,
    /// Remove the cgroup.
    pub cgroup: bool,
    /// Return this slot to the pool.
    pub slot: Option<u32>,
}

impl<'a> Release<'a> {
    /// Everything a fully created sandbox owns.
    pub fn all(layout: &'a ResourceLayout, network: &'a NetworkEnv) -> Self {
        Self {
            layout,
            network: Some(network),
            files: true,
            cgroup: true,
            slot: Some(network.slot()),
        }
    }
}

impl HostResources {
    /// Validate `config` and set up DNS and the slot pool for it.
    pub fn new(config: HostConfig, host: Arc<dyn HostNetwork>) -> Result<Self> {
        config.validate()?;
        let capacity = config.slot_capacity()?;
        let dns = Arc::new(DnsRegistry::new(
            config.dns_hosts_file.clone(),
            config.dns_domain.clone(),
        ));
        tracing::info!(
            data_root = %config.data_root.display(),
            subnet = %config.subnet,
            uplink = %config.uplink,
            slots = capacity,
            "Host resources ready"
        );
        Ok(Self {
            network: NetworkWiring::new(host, dns, config.uplink.clone()),
            fs: FilesystemProvisioner::new(),
            slots: SlotPool::new(capacity),
            config,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkWiring {
        &self.network
    }

    pub fn fs(&self) -> &FilesystemProvisioner {
        &self.fs
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    pub fn dns(&self) -> &Arc<DnsRegistry> {
        self.network.dns()
    }

    /// Paths for `sandbox_id` of `template_id` under this host's roots.
    pub fn layout(&self, template_id: &str, sandbox_id: &str) -> Result<ResourceLayout> {
        let identity = SandboxIdentity::new(template_id, sandbox_id, &self.config.data_root)?;
        Ok(ResourceLayout::new(
            identity,
            &self.config.cgroup_root,
            &self.config.cgroup_name,
        ))
    }

    pub fn network_env(&self, sandbox_id: &str, slot: u32) -> Result<NetworkEnv> {
        NetworkEnv::for_slot(sandbox_id, slot, &self.config.subnet)
    }

    /// Release the selected resources, attempting every one.
    ///
    /// The slot is only returned when the network teardown succeeded, so
    /// leftover interfaces are never handed to a new sandbox.
    pub async fn release(&self, release: Release<'_>) -> Result<()> {
        let sandbox_id = release.layout.sandbox_id();
        let mut steps = BestEffort::new("release", sandbox_id);

        let network_ok = match release.network {
            Some(env) => steps
                .record("network teardown", self.network.teardown(env, sandbox_id).await)
                .is_some(),
            None => true,
        };

        if release.files {
            steps.record(
                "filesystem cleanup",
                self.fs.cleanup(release.layout, false).await,
            );
        }

        // last: the kernel may still be accounting the hypervisor
        if release.cgroup {
            steps.record(
                "remove cgroup",
                cgroup::remove(&release.layout.cgroup_path()).await,
            );
        }

        if let Some(slot) = release.slot {
            if network_ok {
                self.slots.release(slot);
            } else {
                tracing::warn!(sandbox_id, slot, "Keeping slot reserved after failed network teardown");
            }
        }

        steps.finish()
    }
}
