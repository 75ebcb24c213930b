//! Recovery of hypervisor processes the registry does not know about.
//!
//! After an orchestrator restart the registry is empty but the launchers
//! (`unshare ... ip netns exec <ns> firecracker ...`) keep running. Their
//! command lines carry everything needed to rebuild a [`SandboxInfo`]:
//!
//! ```text
//! unshare --fork --kill-child -m -- sh -c echo $$ > '.../cgroup.procs' && ...
//!     mount --bind '<root>/instances/<template>/<sandbox>' ... &&
//!     exec ip netns exec '<sandbox>-<slot>' '/usr/local/bin/firecracker' --api-sock ...
//! ```

use crate::address::Ipv4Cidr;
use crate::best_effort::BestEffort;
use crate::error::{CoreError, Result};
use crate::host::{HostResources, Release};
use crate::network::NetworkEnv;
use crate::registry::SandboxRegistry;
use async_trait::async_trait;
use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Serialize;
use skerry_vm::command::{LAUNCHER_PROGRAM, NETNS_EXEC};
use std::path::PathBuf;
use std::sync::Arc;

/// Hypervisor binaries a launcher may exec.
pub const HYPERVISOR_NAMES: [&str; 2] = ["firecracker", "cloud-hypervisor"];

lazy_static! {
    static ref TEMPLATE_RE: Regex = Regex::new(r"/instances/([\w-]+)/").expect("static pattern");
    static ref INSTANCE_RE: Regex =
        Regex::new(r"/instances/([\w-]+)/([\w-]+)").expect("static pattern");
    static ref NETNS_RE: Regex = Regex::new(r"ip netns exec '?([\w-]+)'?").expect("static pattern");
}

/// A host process as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Arguments joined with single spaces.
    pub cmdline: String,
}

/// Access to host processes.
#[async_trait]
pub trait HostProcesses: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessEntry>>;

    /// SIGKILL `pid`. An already-dead process counts as killed.
    async fn kill(&self, pid: u32) -> Result<()>;
}

/// Reads `/proc` and signals with `kill(2)`.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

#[async_trait]
impl HostProcesses for ProcFs {
    async fn list(&self) -> Result<Vec<ProcessEntry>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CoreError::path("read", &self.root, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CoreError::path("read", &self.root, e))?
        {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // processes exit while we scan
            let Ok(raw) = tokio::fs::read(entry.path().join("cmdline")).await else {
                continue;
            };
            let cmdline = raw
                .split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ");
            if !cmdline.is_empty() {
                entries.push(ProcessEntry { pid, cmdline });
            }
        }
        Ok(entries)
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(CoreError::Io(errno.into())),
        }
    }
}

/// What recovery knows about an unregistered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: String,
    pub pid: u32,
    pub network: NetworkEnv,
}

/// Whether `cmdline` looks like a sandbox launcher.
pub fn is_launcher(cmdline: &str) -> bool {
    cmdline.starts_with(LAUNCHER_PROGRAM)
        && cmdline.contains(NETNS_EXEC)
        && HYPERVISOR_NAMES.iter().any(|name| cmdline.contains(name))
}

/// Whether `cmdline` is a launcher mentioning `sandbox_id`.
///
/// This is a substring test, so `sbx-1` also matches a launcher for
/// `sbx-10`; discovery refuses to pick when that happens.
pub fn matches_sandbox(cmdline: &str, sandbox_id: &str) -> bool {
    is_launcher(cmdline) && cmdline.contains(sandbox_id)
}

/// Template id from the `/instances/<template>/` path in `cmdline`.
pub fn parse_template_id(cmdline: &str) -> Result<String> {
    TEMPLATE_RE
        .captures(cmdline)
        .map(|c| c[1].to_string())
        .ok_or_else(|| CoreError::Validation(format!("no template id in '{cmdline}'")))
}

/// Sandbox id from the `/instances/<template>/<sandbox>` path in `cmdline`.
pub fn parse_sandbox_id(cmdline: &str) -> Option<String> {
    INSTANCE_RE.captures(cmdline).map(|c| c[2].to_string())
}

/// Rebuild the network environment from the `ip netns exec` fragment.
pub fn parse_network_env(cmdline: &str, subnet: &Ipv4Cidr) -> Result<NetworkEnv> {
    let netns = NETNS_RE
        .captures(cmdline)
        .map(|c| c[1].to_string())
        .ok_or_else(|| CoreError::Validation(format!("no network namespace in '{cmdline}'")))?;
    let (sandbox_id, slot) = NetworkEnv::parse_netns(&netns)
        .ok_or_else(|| CoreError::Validation(format!("malformed namespace name '{netns}'")))?;
    NetworkEnv::for_slot(sandbox_id, slot, subnet)
}

/// Scans for and purges orphaned sandboxes.
#[derive(Clone)]
pub struct OrphanRecovery {
    processes: Arc<dyn HostProcesses>,
    host: Arc<HostResources>,
}

impl OrphanRecovery {
    pub fn new(processes: Arc<dyn HostProcesses>, host: Arc<HostResources>) -> Self {
        Self { processes, host }
    }

    fn info(&self, entry: &ProcessEntry, sandbox_id: &str) -> Result<SandboxInfo> {
        Ok(SandboxInfo {
            sandbox_id: sandbox_id.to_string(),
            template_id: parse_template_id(&entry.cmdline)?,
            pid: entry.pid,
            network: parse_network_env(&entry.cmdline, &self.host.config().subnet)?,
        })
    }

    /// Find the one launcher process for `sandbox_id`.
    ///
    /// No match is [`CoreError::NotFound`]; more than one is
    /// [`CoreError::Ambiguous`] and nothing is touched. A single match whose
    /// instance path names another sandbox is refused with
    /// [`CoreError::Validation`].
    pub async fn discover_orphan(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let matches: Vec<ProcessEntry> = self
            .processes
            .list()
            .await?
            .into_iter()
            .filter(|p| matches_sandbox(&p.cmdline, sandbox_id))
            .collect();

        match matches.as_slice() {
            [] => Err(CoreError::NotFound(format!(
                "no hypervisor process for sandbox {sandbox_id}"
            ))),
            [entry] => {
                let owner = parse_sandbox_id(&entry.cmdline);
                if owner.as_deref() != Some(sandbox_id) {
                    return Err(CoreError::Validation(format!(
                        "launcher pid {} belongs to sandbox {}, not {sandbox_id}",
                        entry.pid,
                        owner.as_deref().unwrap_or("<unknown>")
                    )));
                }
                let info = self.info(entry, sandbox_id)?;
                tracing::debug!(sandbox_id, pid = info.pid, netns = info.network.netns(), "Orphan discovered");
                Ok(info)
            }
            many => Err(CoreError::Ambiguous {
                sandbox_id: sandbox_id.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Every launcher whose sandbox is not in `registry`.
    pub async fn list_orphans(&self, registry: &SandboxRegistry) -> Result<Vec<SandboxInfo>> {
        let mut orphans = Vec::new();
        for entry in self.processes.list().await? {
            if !is_launcher(&entry.cmdline) {
                continue;
            }
            let Some(sandbox_id) = parse_sandbox_id(&entry.cmdline) else {
                tracing::warn!(pid = entry.pid, "Launcher without instance path, skipping");
                continue;
            };
            if registry.contains(&sandbox_id).await {
                continue;
            }
            match self.info(&entry, &sandbox_id) {
                Ok(info) => orphans.push(info),
                Err(e) => tracing::warn!(pid = entry.pid, sandbox_id = %sandbox_id, error = %e, "Unparseable launcher, skipping"),
            }
        }
        Ok(orphans)
    }

    /// Kill the process and release its network, files, cgroup and slot.
    ///
    /// The slot is left alone if a registered sandbox holds it.
    pub async fn purge(&self, info: &SandboxInfo, registry: &SandboxRegistry) -> Result<()> {
        tracing::info!(sandbox_id = %info.sandbox_id, pid = info.pid, "Purging orphan");
        let layout = self.host.layout(&info.template_id, &info.sandbox_id)?;
        let mut steps = BestEffort::new("orphan purge", info.sandbox_id.as_str());

        steps.record("kill", self.processes.kill(info.pid).await);

        let mut release = Release::all(&layout, &info.network);
        if registry.holds_slot(info.network.slot()).await {
            release.slot = None;
        }
        steps.record("release", self.host.release(release).await);

        steps.finish()
    }
}
