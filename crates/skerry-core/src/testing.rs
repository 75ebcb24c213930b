//! In-memory stand-ins for the host, shared by unit tests.

use crate::config::{HostConfig, HostConfigBuilder, ResourceLimits};
use crate::error::{CoreError, Result};
use crate::host::HostResources;
use crate::network::{HostNetwork, IptablesAction, IptablesRule, NetCommand};
use crate::orphan::{HostProcesses, ProcessEntry};
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use skerry_vm::command::launch_argv;
use skerry_vm::{Hypervisor, LaunchBuilder, LaunchConfig, VmError, VmProcess, VmState};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

type Scope = Option<String>;

#[derive(Debug, Default, Clone)]
pub struct NetState {
    pub netns: BTreeSet<String>,
    pub links: BTreeSet<(Scope, String)>,
    pub routes: BTreeSet<(Scope, String)>,
    pub rules: Vec<(Scope, IptablesRule)>,
    /// host veth -> (namespace, peer)
    pub pairs: HashMap<String, (String, String)>,
}

impl NetState {
    fn scope_exists(&self, scope: &Scope) -> bool {
        scope.as_ref().map_or(true, |ns| self.netns.contains(ns))
    }

    fn drop_link(&mut self, scope: &Scope, name: &str) -> bool {
        let removed = self.links.remove(&(scope.clone(), name.to_string()));
        if scope.is_none() {
            if let Some((ns, peer)) = self.pairs.remove(name) {
                self.links.remove(&(Some(ns), peer));
            }
        } else {
            let host = self
                .pairs
                .iter()
                .find(|(_, (ns, peer))| scope.as_deref() == Some(ns.as_str()) && peer == name)
                .map(|(host, _)| host.clone());
            if let Some(host) = host {
                self.pairs.remove(&host);
                self.links.remove(&(None, host));
            }
        }
        removed
    }
}

type FailPredicate = Box<dyn Fn(&NetCommand) -> bool + Send + Sync>;

/// Models namespaces, links, routes and rules closely enough to check
/// that teardown undoes setup.
#[derive(Default)]
pub struct FakeHostNetwork {
    state: Mutex<NetState>,
    fail: Mutex<Option<FailPredicate>>,
}

fn refused(cmd: &NetCommand, stderr: &str) -> CoreError {
    CoreError::Command {
        command: cmd.to_string(),
        status: "exit status: 2".into(),
        stderr: stderr.into(),
    }
}

impl FakeHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command matching `predicate` from now on.
    pub fn fail_when(&self, predicate: impl Fn(&NetCommand) -> bool + Send + Sync + 'static) {
        *self.fail.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn netns_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().netns.contains(name)
    }

    pub fn link_exists(&self, netns: Option<&str>, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .links
            .contains(&(netns.map(String::from), name.to_string()))
    }

    pub fn rule_count(&self, netns: Option<&str>) -> usize {
        self.state
            .lock()
            .unwrap()
            .rules
            .iter()
            .filter(|(scope, _)| scope.as_deref() == netns)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.netns.is_empty() && s.links.is_empty() && s.routes.is_empty() && s.rules.is_empty()
    }

    pub fn snapshot(&self) -> NetState {
        self.state.lock().unwrap().clone()
    }

    fn apply(&self, cmd: &NetCommand) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        match cmd {
            NetCommand::AddNetns { name } => {
                if !s.netns.insert(name.clone()) {
                    return Err(refused(cmd, "File exists"));
                }
            }
            NetCommand::DelNetns { name } => {
                if s.netns.remove(name) {
                    let scope = Some(name.clone());
                    s.links.retain(|(ns, _)| *ns != scope);
                    s.routes.retain(|(ns, _)| *ns != scope);
                    s.rules.retain(|(ns, _)| *ns != scope);
                    let hosts: Vec<String> = s
                        .pairs
                        .iter()
                        .filter(|(_, (ns, _))| ns == name)
                        .map(|(host, _)| host.clone())
                        .collect();
                    for host in hosts {
                        s.pairs.remove(&host);
                        s.links.remove(&(None, host));
                    }
                }
            }
            NetCommand::AddVethPair {
                host,
                peer,
                peer_netns,
            } => {
                if !s.netns.contains(peer_netns) {
                    return Err(refused(cmd, "Cannot open network namespace"));
                }
                if s.links.contains(&(None, host.clone())) {
                    return Err(refused(cmd, "RTNETLINK answers: File exists"));
                }
                s.links.insert((None, host.clone()));
                s.links.insert((Some(peer_netns.clone()), peer.clone()));
                s.pairs.insert(host.clone(), (peer_netns.clone(), peer.clone()));
            }
            NetCommand::DelLink { netns, name } => {
                s.drop_link(netns, name);
            }
            NetCommand::AddTap { netns, name } => {
                if !s.netns.contains(netns) {
                    return Err(refused(cmd, "Cannot open network namespace"));
                }
                if !s.links.insert((Some(netns.clone()), name.clone())) {
                    return Err(refused(cmd, "Device or resource busy"));
                }
            }
            NetCommand::AddAddr { netns, dev, .. } | NetCommand::LinkUp { netns, dev } => {
                let present = (dev == "lo" && s.scope_exists(netns))
                    || s.links.contains(&(netns.clone(), dev.clone()));
                if !present {
                    return Err(refused(cmd, "Cannot find device"));
                }
            }
            NetCommand::AddRoute { netns, dest, .. } => {
                if !s.scope_exists(netns) {
                    return Err(refused(cmd, "Cannot open network namespace"));
                }
                if !s.routes.insert((netns.clone(), dest.clone())) {
                    return Err(refused(cmd, "RTNETLINK answers: File exists"));
                }
            }
            NetCommand::DelRoute { netns, dest, .. } => {
                s.routes.remove(&(netns.clone(), dest.clone()));
            }
            NetCommand::Iptables {
                netns,
                action: IptablesAction::Append,
                rule,
            } => {
                if !s.scope_exists(netns) {
                    return Err(refused(cmd, "Cannot open network namespace"));
                }
                s.rules.push((netns.clone(), rule.clone()));
            }
            NetCommand::Iptables {
                netns,
                action: IptablesAction::Delete,
                rule,
            } => {
                if let Some(i) = s.rules.iter().position(|(ns, r)| ns == netns && r == rule) {
                    s.rules.remove(i);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HostNetwork for FakeHostNetwork {
    async fn run(&self, cmd: &NetCommand) -> Result<()> {
        let injected = self.fail.lock().unwrap().as_ref().is_some_and(|f| f(cmd));
        if injected {
            return Err(refused(cmd, "injected failure"));
        }
        self.apply(cmd)
    }
}

struct VmInner {
    pid: u32,
    state: Mutex<VmState>,
    stops: AtomicUsize,
    /// Stop calls to swallow before the process dies.
    ignore_stops: usize,
    killed: watch::Sender<bool>,
}

/// A process that runs until stopped.
#[derive(Clone)]
pub struct FakeVm {
    inner: Arc<VmInner>,
}

impl FakeVm {
    fn with_ignored_stops(pid: u32, ignore_stops: usize) -> Self {
        let (killed, _) = watch::channel(false);
        Self {
            inner: Arc::new(VmInner {
                pid,
                state: Mutex::new(VmState::Running),
                stops: AtomicUsize::new(0),
                ignore_stops,
                killed,
            }),
        }
    }

    pub fn running(pid: u32) -> Self {
        Self::with_ignored_stops(pid, 0)
    }

    /// Ignores its first stop signal.
    pub fn stubborn(pid: u32) -> Self {
        Self::with_ignored_stops(pid, 1)
    }

    pub fn stop_calls(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> VmState {
        *self.inner.state.lock().unwrap()
    }
}

#[async_trait]
impl VmProcess for FakeVm {
    fn pid(&self) -> Option<u32> {
        Some(self.inner.pid)
    }

    fn state(&self) -> VmState {
        FakeVm::state(self)
    }

    async fn stop(&self) -> skerry_vm::Result<()> {
        let calls = self.inner.stops.fetch_add(1, Ordering::SeqCst) + 1;
        if calls > self.inner.ignore_stops {
            self.inner.killed.send_replace(true);
        }
        Ok(())
    }

    async fn wait(&self) -> skerry_vm::Result<Option<i32>> {
        let mut killed = self.inner.killed.subscribe();
        killed
            .wait_for(|k| *k)
            .await
            .map_err(|_| VmError::Spawn("fake process vanished".into()))?;
        *self.inner.state.lock().unwrap() = VmState::Exited;
        Ok(Some(137))
    }
}

#[derive(Default)]
struct HypervisorState {
    launched: Vec<LaunchConfig>,
    vms: Vec<FakeVm>,
    fail_next: Option<String>,
    delay: Duration,
    stubborn: bool,
    processes: Option<Arc<FakeProcesses>>,
}

/// Records launch configs and hands out [`FakeVm`]s.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
    next_pid: AtomicU32,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            next_pid: AtomicU32::new(1000),
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// Make every launch take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Hand out processes that ignore their first stop.
    pub fn stubborn(&self) {
        self.state.lock().unwrap().stubborn = true;
    }

    /// Show each launcher in `processes` from spawn on, as `/proc` would.
    pub fn publish_to(&self, processes: Arc<FakeProcesses>) {
        self.state.lock().unwrap().processes = Some(processes);
    }

    pub fn launched(&self) -> Vec<LaunchConfig> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn vms(&self) -> Vec<FakeVm> {
        self.state.lock().unwrap().vms.clone()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, config: LaunchConfig) -> skerry_vm::Result<Box<dyn VmProcess>> {
        config.validate()?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (delay, processes) = {
            let state = self.state.lock().unwrap();
            (state.delay, state.processes.clone())
        };
        if let Some(processes) = processes {
            processes.add(pid, &launch_argv(&config).join(" "));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next.take() {
            return Err(VmError::Api(message));
        }

        if let Some(dir) = config.socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&config.socket_path, b"")?;

        let vm = if state.stubborn {
            FakeVm::stubborn(pid)
        } else {
            FakeVm::running(pid)
        };
        state.launched.push(config);
        state.vms.push(vm.clone());
        Ok(Box::new(vm))
    }
}

/// A process table the test controls.
#[derive(Default)]
pub struct FakeProcesses {
    procs: Mutex<Vec<ProcessEntry>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pid: u32, cmdline: &str) {
        self.procs.lock().unwrap().push(ProcessEntry {
            pid,
            cmdline: cmdline.to_string(),
        });
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.procs.lock().unwrap().len()
    }
}

#[async_trait]
impl HostProcesses for FakeProcesses {
    async fn list(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.procs.lock().unwrap().clone())
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        self.procs.lock().unwrap().retain(|p| p.pid != pid);
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

/// The command line a real launch of `sandbox` on `slot` would have.
pub fn launcher_cmdline(root: impl AsRef<Path>, template: &str, sandbox: &str, slot: u32) -> String {
    let root = root.as_ref();
    let config = LaunchBuilder::new(sandbox)
        .netns(format!("{sandbox}-{slot}"))
        .socket(root.join("sockets").join(format!("{sandbox}.sock")))
        .firecracker_path("/usr/local/bin/firecracker")
        .cgroup_procs(format!("/sys/fs/cgroup/skerry/{sandbox}/cgroup.procs"))
        .bind_mount(
            root.join("instances").join(template).join(sandbox),
            root.join("templates").join(template).join("run"),
        )
        .build_config();
    launch_argv(&config).join(" ")
}

/// A host rooted in a temp directory with template `tmpl-a` seeded.
pub struct TestHost {
    _dir: TempDir,
    pub net: Arc<FakeHostNetwork>,
    pub host: Arc<HostResources>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(|b| b)
    }

    pub fn with_config(customize: impl FnOnce(HostConfigBuilder) -> HostConfigBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let template = root.join("templates").join("tmpl-a");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(template.join("rootfs.ext4"), b"base image").unwrap();
        std::fs::write(template.join("writable-rootfs.ext4"), b"writable delta").unwrap();
        let kernel = dir.path().join("vmlinux");
        std::fs::write(&kernel, b"kernel").unwrap();

        let builder = HostConfig::builder()
            .data_root(&root)
            .cgroup_root(dir.path().join("cgroup"))
            .kernel(&kernel);
        let config = customize(builder).build().unwrap();

        let net = Arc::new(FakeHostNetwork::new());
        let host = Arc::new(HostResources::new(config, net.clone()).unwrap());
        Self { _dir: dir, net, host }
    }

    pub fn data_root(&self) -> PathBuf {
        self.host.config().data_root.clone()
    }

    /// A sandbox with files, network and cgroup in place, wrapping `vm`.
    pub async fn sandbox(&self, id: &str, vm: FakeVm) -> Arc<Sandbox> {
        let slot = self.host.slots().acquire().unwrap();
        let layout = self.host.layout("tmpl-a", id).unwrap();
        let env = self.host.network_env(id, slot).unwrap();
        self.host.fs().provision(&layout, true).await.unwrap();
        self.host.network().setup(&env, id).await.unwrap();
        crate::cgroup::create(&layout.cgroup_path()).await.unwrap();
        Arc::new(Sandbox::new(
            layout,
            env,
            true,
            ResourceLimits::default(),
            HashMap::new(),
            Box::new(vm),
            self.host.clone(),
        ))
    }

    /// A sandbox on `slot` with nothing created on the host.
    pub fn sandbox_unprovisioned(&self, id: &str, slot: u32, vm: FakeVm) -> Arc<Sandbox> {
        let layout = self.host.layout("tmpl-a", id).unwrap();
        let env = self.host.network_env(id, slot).unwrap();
        Arc::new(Sandbox::new(
            layout,
            env,
            false,
            ResourceLimits::default(),
            HashMap::new(),
            Box::new(vm),
            self.host.clone(),
        ))
    }
}
