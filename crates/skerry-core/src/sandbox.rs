//! Sandbox type - a running hypervisor with its network, files and cgroup.

use crate::config::ResourceLimits;
use crate::error::Result;
use crate::host::{HostResources, Release};
use crate::layout::ResourceLayout;
use crate::network::NetworkEnv;
use chrono::{DateTime, Utc};
use serde::Serialize;
use skerry_vm::{VmProcess, VmState};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A live sandbox.
///
/// Owns its network environment and instance tree exclusively. Host
/// resources are released by [`cleanup`](Self::cleanup), which runs at most
/// once no matter how many callers reach it.
pub struct Sandbox {
    layout: ResourceLayout,
    network: NetworkEnv,
    overlay: bool,
    limits: ResourceLimits,
    metadata: HashMap<String, String>,
    process: Box<dyn VmProcess>,
    host: Arc<HostResources>,
    created_at: DateTime<Utc>,
    cleaned: AtomicBool,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.id())
            .field("template_id", &self.template_id())
            .field("netns", &self.network.netns())
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable view of a sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub template_id: String,
    pub state: String,
    pub pid: Option<u32>,
    pub overlay: bool,
    pub slot: u32,
    pub netns: String,
    pub host_cloned_ip: Ipv4Addr,
    pub vcpu_count: u8,
    pub memory_mib: u32,
    pub socket_path: PathBuf,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub(crate) fn new(
        layout: ResourceLayout,
        network: NetworkEnv,
        overlay: bool,
        limits: ResourceLimits,
        metadata: HashMap<String, String>,
        process: Box<dyn VmProcess>,
        host: Arc<HostResources>,
    ) -> Self {
        Self {
            layout,
            network,
            overlay,
            limits,
            metadata,
            process,
            host,
            created_at: Utc::now(),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.layout.sandbox_id()
    }

    pub fn template_id(&self) -> &str {
        self.layout.template_id()
    }

    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }

    pub fn network(&self) -> &NetworkEnv {
        &self.network
    }

    pub fn overlay(&self) -> bool {
        self.overlay
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> VmState {
        self.process.state()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Kill the hypervisor.
    pub async fn stop(&self) -> Result<()> {
        tracing::debug!(sandbox_id = %self.id(), pid = self.pid(), "Stopping sandbox");
        self.process.stop().await?;
        Ok(())
    }

    /// Wait up to `timeout` for the hypervisor to exit.
    ///
    /// On timeout the process is killed again and reaped without a deadline.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %self.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Hypervisor did not exit in time, force killing"
                );
                self.process.stop().await?;
                self.process.wait().await?;
            }
        }
        Ok(())
    }

    /// Release network, files, cgroup and slot. Runs once.
    pub async fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            tracing::trace!(sandbox_id = %self.id(), "Cleanup already done");
            return Ok(());
        }
        let start = std::time::Instant::now();
        let result = self
            .host
            .release(Release::all(&self.layout, &self.network))
            .await;
        tracing::info!(
            sandbox_id = %self.id(),
            ok = result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox cleaned up"
        );
        result
    }

    pub fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            sandbox_id: self.id().to_string(),
            template_id: self.template_id().to_string(),
            state: self.state().to_string(),
            pid: self.pid(),
            overlay: self.overlay,
            slot: self.network.slot(),
            netns: self.network.netns().to_string(),
            host_cloned_ip: self.network.host_cloned_ip(),
            vcpu_count: self.limits.vcpu_count,
            memory_mib: self.limits.memory_mib,
            socket_path: self.layout.socket_path(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}
