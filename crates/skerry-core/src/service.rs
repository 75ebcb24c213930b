//! Create, delete and recovery flows over the registry.

use crate::best_effort::BestEffort;
use crate::cgroup;
use crate::config::{HostConfig, ResourceLimits, SandboxSpec};
use crate::error::{CoreError, Result};
use crate::host::{HostResources, Release};
use crate::layout::{ResourceLayout, ROOTFS_NAME, WRITABLE_ROOTFS_NAME};
use crate::network::{HostNetwork, NetworkEnv, TAP_NAME};
use crate::orphan::{HostProcesses, OrphanRecovery, SandboxInfo};
use crate::registry::SandboxRegistry;
use crate::sandbox::Sandbox;
use serde::Serialize;
use skerry_vm::{Hypervisor, LaunchBuilder, VmProcess};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Drive id of the writable delta in overlay mode.
pub const WRITABLE_DRIVE_ID: &str = "writable";

/// Outcome of purging one orphan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub sandbox_id: String,
    pub purged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a create has done so far, for rollback. Nothing after the
/// hypervisor launch can fail, so no process is tracked here.
#[derive(Default)]
struct Progress {
    layout: Option<ResourceLayout>,
    slot: Option<u32>,
    network: Option<NetworkEnv>,
    files: bool,
    /// Copy still running on the blocking pool.
    provisioning: Option<JoinHandle<Result<()>>>,
    cgroup: bool,
}

/// Ids with a create in flight.
type Pending = Arc<Mutex<HashSet<String>>>;

/// Holds an id in the pending set until the create task ends.
struct Claim {
    pending: Pending,
    id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Front door for sandbox lifecycle operations.
///
/// # Example
///
/// ```ignore
/// let service = SandboxService::new(host, Arc::new(Firecracker::default()), Arc::new(ProcFs::default()));
/// let spec = SandboxSpec::builder().sandbox_id("sbx-1").template_id("base").overlay(true).build()?;
/// let sandbox = service.create(spec).await?;
/// service.delete(sandbox.id()).await?;
/// ```
pub struct SandboxService {
    host: Arc<HostResources>,
    registry: Arc<SandboxRegistry>,
    hypervisor: Arc<dyn Hypervisor>,
    orphans: OrphanRecovery,
    pending: Pending,
}

/// Everything a create task owns.
struct Creator {
    host: Arc<HostResources>,
    registry: Arc<SandboxRegistry>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl SandboxService {
    pub fn new(
        host: Arc<HostResources>,
        hypervisor: Arc<dyn Hypervisor>,
        processes: Arc<dyn HostProcesses>,
    ) -> Self {
        Self {
            orphans: OrphanRecovery::new(processes, host.clone()),
            registry: Arc::new(SandboxRegistry::new()),
            host,
            hypervisor,
            pending: Pending::default(),
        }
    }

    /// Build host resources from `config` and wrap them in a service.
    pub fn from_config(
        config: HostConfig,
        network: Arc<dyn HostNetwork>,
        hypervisor: Arc<dyn Hypervisor>,
        processes: Arc<dyn HostProcesses>,
    ) -> Result<Self> {
        let host = Arc::new(HostResources::new(config, network)?);
        Ok(Self::new(host, hypervisor, processes))
    }

    pub fn host(&self) -> &Arc<HostResources> {
        &self.host
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Sandbox>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("sandbox {id}")))
    }

    pub async fn list(&self) -> Vec<Arc<Sandbox>> {
        self.registry.list().await
    }

    fn claim(&self, id: &str) -> Option<Claim> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.insert(id.to_string()) {
            return None;
        }
        Some(Claim {
            pending: self.pending.clone(),
            id: id.to_string(),
        })
    }

    fn is_pending(&self, id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Create and register a sandbox.
    ///
    /// Runs under the request's deadline (or the host default). Any failure,
    /// including the deadline, rolls back everything attempted so far.
    ///
    /// The work happens on its own task. Dropping the returned future
    /// cancels the create, and the task rolls back before the id is
    /// released.
    pub async fn create(&self, spec: SandboxSpec) -> Result<Arc<Sandbox>> {
        spec.validate()?;
        let id = spec.sandbox_id.clone();

        if self.registry.contains(&id).await {
            return Err(CoreError::AlreadyExists(id));
        }
        let Some(claim) = self.claim(&id) else {
            return Err(CoreError::AlreadyExists(id));
        };

        let creator = Creator {
            host: self.host.clone(),
            registry: self.registry.clone(),
            hypervisor: self.hypervisor.clone(),
        };
        let (_cancel, cancelled) = oneshot::channel::<()>();
        tokio::spawn(creator.run(spec, claim, cancelled))
            .await
            .map_err(|e| CoreError::Io(io::Error::other(e)))?
    }

    /// Stop, reap and clean up a sandbox, then unregister it.
    ///
    /// Cleanup failures are returned as [`CoreError::PartialFailure`] after
    /// the sandbox has been removed from the registry.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let sandbox = self.get(id).await?;
        let start = Instant::now();
        tracing::info!(sandbox_id = %id, "Deleting sandbox");

        let mut steps = BestEffort::new("delete", id);
        steps.record("stop", sandbox.stop().await);
        steps.record("wait", sandbox.wait(self.host.config().stop_timeout).await);
        steps.record("cleanup", sandbox.cleanup().await);
        self.registry.remove(id).await;

        tracing::info!(
            sandbox_id = %id,
            failed = steps.failed(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox deleted"
        );
        steps.finish()
    }

    /// Launchers on the host whose sandbox is neither registered nor
    /// still being created.
    pub async fn list_orphans(&self) -> Result<Vec<SandboxInfo>> {
        let mut orphans = self.orphans.list_orphans(&self.registry).await?;
        orphans.retain(|info| {
            let pending = self.is_pending(&info.sandbox_id);
            if pending {
                tracing::debug!(sandbox_id = %info.sandbox_id, pid = info.pid, "Create in flight, not an orphan");
            }
            !pending
        });
        Ok(orphans)
    }

    /// Purge the given orphans, or every discovered orphan when `ids` is empty.
    pub async fn purge_orphans(&self, ids: &[String]) -> Result<Vec<PurgeReport>> {
        let mut reports = Vec::new();

        if ids.is_empty() {
            for info in self.list_orphans().await? {
                let result = self.orphans.purge(&info, &self.registry).await;
                reports.push(report(&info.sandbox_id, result));
            }
            return Ok(reports);
        }

        for id in ids {
            let result = async {
                if self.registry.contains(id).await {
                    return Err(CoreError::Validation(format!(
                        "sandbox {id} is registered, delete it instead"
                    )));
                }
                if self.is_pending(id) {
                    return Err(CoreError::Validation(format!(
                        "sandbox {id} is still being created"
                    )));
                }
                let info = self.orphans.discover_orphan(id).await?;
                self.orphans.purge(&info, &self.registry).await
            }
            .await;
            reports.push(report(id, result));
        }
        Ok(reports)
    }

    /// Reserve the slots held by orphans so new sandboxes never reuse them.
    pub async fn adopt_orphan_slots(&self) -> Result<Vec<SandboxInfo>> {
        let orphans = self.list_orphans().await?;
        for info in &orphans {
            let slot = info.network.slot();
            match self.host.slots().reserve(slot) {
                Ok(true) => {
                    tracing::warn!(sandbox_id = %info.sandbox_id, pid = info.pid, slot, "Reserved slot of orphan")
                }
                Ok(false) => {
                    tracing::warn!(sandbox_id = %info.sandbox_id, slot, "Orphan slot already reserved")
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %info.sandbox_id, slot, error = %e, "Orphan slot outside pool")
                }
            }
        }
        Ok(orphans)
    }

    /// Tear down every registered sandbox and release host-global state.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry
            .shutdown_all(&self.host, self.host.config().stop_timeout)
            .await
    }
}

impl Creator {
    async fn run(
        self,
        spec: SandboxSpec,
        _claim: Claim,
        cancelled: oneshot::Receiver<()>,
    ) -> Result<Arc<Sandbox>> {
        let id = spec.sandbox_id.clone();
        let deadline = spec.timeout.unwrap_or(self.host.config().create_timeout);
        let start = Instant::now();
        tracing::info!(
            sandbox_id = %id,
            template_id = %spec.template_id,
            overlay = spec.overlay,
            "Creating sandbox"
        );

        let mut progress = Progress::default();
        let outcome = tokio::select! {
            built = tokio::time::timeout(deadline, self.build(&spec, &mut progress)) => {
                built.unwrap_or(Err(CoreError::Timeout(deadline)))
            }
            _ = cancelled => Err(CoreError::Cancelled),
        };

        let sandbox = match outcome {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Create failed, rolling back");
                self.rollback(&id, progress).await;
                return Err(e);
            }
        };

        if self.registry.insert(sandbox.clone()).await {
            // the files are shared paths now owned by the winner
            tracing::warn!(sandbox_id = %id, "Lost create race, discarding duplicate");
            self.discard_duplicate(&sandbox).await;
            return Err(CoreError::AlreadyExists(id));
        }

        tracing::info!(
            sandbox_id = %id,
            pid = sandbox.pid(),
            host_cloned_ip = %sandbox.network().host_cloned_ip(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox ready"
        );
        Ok(sandbox)
    }

    async fn build(&self, spec: &SandboxSpec, progress: &mut Progress) -> Result<Arc<Sandbox>> {
        let id = spec.sandbox_id.as_str();
        let limits: ResourceLimits = spec.limits.unwrap_or(self.host.config().default_limits);

        let layout = self.host.layout(&spec.template_id, id)?;
        if tokio::fs::try_exists(layout.instance_dir()).await.unwrap_or(false) {
            return Err(CoreError::AlreadyExists(format!(
                "instance directory {} (orphan?)",
                layout.instance_dir().display()
            )));
        }
        progress.layout = Some(layout.clone());

        let slot = self.host.slots().acquire()?;
        progress.slot = Some(slot);
        let env = self.host.network_env(id, slot)?;

        progress.files = true;
        let fs = *self.host.fs();
        let (target, overlay) = (layout.clone(), spec.overlay);
        let provisioning = progress
            .provisioning
            .insert(tokio::spawn(async move { fs.provision(&target, overlay).await }));
        let provisioned = provisioning.await;
        progress.provisioning = None;
        provisioned.map_err(|e| CoreError::Io(io::Error::other(e)))??;

        progress.network = Some(env.clone());
        self.host.network().setup(&env, id).await?;

        progress.cgroup = true;
        cgroup::create(&layout.cgroup_path()).await?;
        cgroup::apply_limits(&layout.cgroup_path(), &limits).await?;

        if let Some(port) = self.host.config().metrics_port {
            let target = SocketAddr::new(env.host_cloned_ip().into(), port);
            self.host.fs().write_metrics_target(&layout, target).await?;
        }

        let process = self
            .launch_builder(&layout, &env, &limits, spec.overlay)
            .launch(self.hypervisor.as_ref())
            .await?;
        tracing::debug!(sandbox_id = %id, pid = process.pid(), "Hypervisor launched");

        Ok(Arc::new(Sandbox::new(
            layout,
            env,
            spec.overlay,
            limits,
            spec.metadata.clone(),
            process,
            self.host.clone(),
        )))
    }

    fn launch_builder(
        &self,
        layout: &ResourceLayout,
        env: &NetworkEnv,
        limits: &ResourceLimits,
        overlay: bool,
    ) -> LaunchBuilder {
        let config = self.host.config();
        let private = layout.private_dir();

        let mut builder = LaunchBuilder::new(layout.sandbox_id())
            .vcpus(limits.vcpu_count)
            .memory_mib(limits.memory_mib)
            .kernel(layout.private_kernel())
            .boot_args(config.boot_args.clone())
            .rootfs(private.join(ROOTFS_NAME))
            .with_network(TAP_NAME)
            .firecracker_path(&config.hypervisor_path)
            .socket(layout.socket_path())
            .netns(env.netns())
            .bind_mount(layout.instance_dir(), &private)
            .bind_mount(&config.kernel_path, layout.private_kernel())
            .cgroup_procs(layout.cgroup_procs());

        if overlay {
            builder = builder
                .rootfs_read_only()
                .with_drive(WRITABLE_DRIVE_ID, private.join(WRITABLE_ROOTFS_NAME));
        }
        builder
    }

    async fn rollback(&self, id: &str, mut progress: Progress) {
        let mut steps = BestEffort::new("create rollback", id);

        // the copy would recreate files under a removed instance dir
        if let Some(provisioning) = progress.provisioning.take() {
            tracing::debug!(sandbox_id = id, "Waiting for provisioning to settle");
            if let Err(e) = provisioning.await {
                tracing::warn!(sandbox_id = id, error = %e, "Provisioning task failed");
            }
        }

        if let Some(layout) = &progress.layout {
            let release = Release {
                layout,
                network: progress.network.as_ref(),
                files: progress.files,
                cgroup: progress.cgroup,
                slot: progress.slot,
            };
            steps.record("release", self.host.release(release).await);
        } else if let Some(slot) = progress.slot {
            self.host.slots().release(slot);
        }

        if let Err(e) = steps.finish() {
            tracing::error!(sandbox_id = id, error = %e, "Rollback incomplete");
        }
    }

    async fn discard_duplicate(&self, sandbox: &Sandbox) {
        let mut steps = BestEffort::new("discard duplicate", sandbox.id());
        steps.record("stop", sandbox.stop().await);
        steps.record("wait", sandbox.wait(self.host.config().stop_timeout).await);
        let release = Release {
            layout: sandbox.layout(),
            network: Some(sandbox.network()),
            files: false,
            cgroup: false,
            slot: Some(sandbox.network().slot()),
        };
        steps.record("release", self.host.release(release).await);
        if let Err(e) = steps.finish() {
            tracing::error!(sandbox_id = %sandbox.id(), error = %e, "Duplicate not fully discarded");
        }
    }
}

fn report(sandbox_id: &str, result: Result<()>) -> PurgeReport {
    match result {
        Ok(()) => PurgeReport {
            sandbox_id: sandbox_id.to_string(),
            purged: true,
            error: None,
        },
        Err(e) => {
            tracing::warn!(sandbox_id, error = %e, "Orphan purge failed");
            PurgeReport {
                sandbox_id: sandbox_id.to_string(),
                purged: false,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetCommand;
    use crate::testing::{launcher_cmdline, FakeHypervisor, FakeProcesses, TestHost};
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;

    struct Fixture {
        host: TestHost,
        hypervisor: Arc<FakeHypervisor>,
        procs: Arc<FakeProcesses>,
        service: SandboxService,
    }

    fn fixture() -> Fixture {
        let host = TestHost::new();
        let hypervisor = Arc::new(FakeHypervisor::new());
        let procs = Arc::new(FakeProcesses::new());
        let service = SandboxService::new(host.host.clone(), hypervisor.clone(), procs.clone());
        Fixture {
            host,
            hypervisor,
            procs,
            service,
        }
    }

    fn spec(id: &str, overlay: bool) -> SandboxSpec {
        SandboxSpec::builder()
            .sandbox_id(id)
            .template_id("tmpl-a")
            .overlay(overlay)
            .build()
            .unwrap()
    }

    fn ino(path: std::path::PathBuf) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_create_delete_end_to_end() {
        let f = fixture();
        let sandbox = f.service.create(spec("sbx-1", true)).await.unwrap();
        let layout = sandbox.layout().clone();
        let netns = sandbox.network().netns().to_string();

        assert!(f.service.registry().contains("sbx-1").await);
        assert_eq!(ino(layout.instance_rootfs()), ino(layout.base_rootfs()));
        assert_ne!(
            ino(layout.instance_writable_rootfs()),
            ino(layout.base_writable_rootfs())
        );
        assert_eq!(
            std::fs::read(layout.instance_writable_rootfs()).unwrap(),
            std::fs::read(layout.base_writable_rootfs()).unwrap()
        );
        assert!(layout.cgroup_path().is_dir());
        assert!(layout.socket_path().exists());
        assert!(f.host.net.netns_exists(&netns));

        let launched = f.hypervisor.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].netns, netns);
        assert!(launched[0].root_drive.is_read_only);
        assert_eq!(launched[0].extra_drives[0].drive_id, WRITABLE_DRIVE_ID);
        assert_eq!(
            launched[0].cgroup_procs.as_deref(),
            Some(layout.cgroup_procs().as_path())
        );

        f.service.delete("sbx-1").await.unwrap();

        assert!(!f.service.registry().contains("sbx-1").await);
        assert!(!layout.instance_dir().exists());
        assert!(!layout.socket_path().exists());
        assert!(!layout.metrics_target().exists());
        assert!(!layout.cgroup_path().exists());
        assert!(!f.host.net.netns_exists(&netns));
        assert!(f.host.net.is_clean(), "left behind: {:?}", f.host.net.snapshot());
        assert_eq!(std::fs::read(layout.base_rootfs()).unwrap(), b"base image");
        assert_eq!(f.host.host.slots().in_use(), 0);
    }

    #[tokio::test]
    async fn test_create_writes_metrics_target_when_configured() {
        let host = TestHost::with_config(|b| b.metrics_port(9100));
        let service = SandboxService::new(
            host.host.clone(),
            Arc::new(FakeHypervisor::new()),
            Arc::new(FakeProcesses::new()),
        );
        let sandbox = service.create(spec("sbx-m", false)).await.unwrap();
        let raw = std::fs::read_to_string(sandbox.layout().metrics_target()).unwrap();
        assert!(raw.contains("10.140.128.1:9100"));
    }

    #[tokio::test]
    async fn test_create_duplicate_is_rejected() {
        let f = fixture();
        f.service.create(spec("sbx-1", true)).await.unwrap();
        let err = f.service.create(spec("sbx-1", true)).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));

        // the original is untouched
        let sandbox = f.service.get("sbx-1").await.unwrap();
        assert!(sandbox.layout().instance_rootfs().exists());
        assert_eq!(f.hypervisor.launched().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_of_same_id() {
        let f = fixture();
        f.hypervisor.set_delay(Duration::from_millis(50));
        let (a, b) = tokio::join!(
            f.service.create(spec("sbx-1", true)),
            f.service.create(spec("sbx-1", true))
        );
        assert!(a.is_ok() != b.is_ok());
        assert_eq!(f.service.registry().len().await, 1);
        assert_eq!(f.host.host.slots().in_use(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back() {
        let f = fixture();
        f.host
            .net
            .fail_when(|cmd| matches!(cmd, NetCommand::AddTap { .. }));

        let err = f.service.create(spec("sbx-2", true)).await.unwrap_err();
        assert!(matches!(err, CoreError::Command { .. }));

        let layout = f.host.host.layout("tmpl-a", "sbx-2").unwrap();
        assert!(!layout.instance_dir().exists());
        assert!(f.host.net.is_clean());
        assert_eq!(f.host.host.slots().in_use(), 0);
        assert!(f.service.registry().is_empty().await);
        assert!(f.hypervisor.launched().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back() {
        let f = fixture();
        f.hypervisor.fail_next("boot-source rejected");

        let err = f.service.create(spec("sbx-3", false)).await.unwrap_err();
        assert!(matches!(err, CoreError::Vm(_)));

        let layout = f.host.host.layout("tmpl-a", "sbx-3").unwrap();
        assert!(!layout.instance_dir().exists());
        assert!(!layout.cgroup_path().exists());
        assert!(f.host.net.is_clean());
        assert_eq!(f.host.host.slots().in_use(), 0);
    }

    #[tokio::test]
    async fn test_deadline_rolls_back() {
        let f = fixture();
        f.hypervisor.set_delay(Duration::from_secs(30));
        let spec = SandboxSpec::builder()
            .sandbox_id("sbx-4")
            .template_id("tmpl-a")
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let err = f.service.create(spec).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));

        let layout = f.host.host.layout("tmpl-a", "sbx-4").unwrap();
        assert!(!layout.instance_dir().exists());
        assert!(f.host.net.is_clean());
        assert_eq!(f.host.host.slots().in_use(), 0);

        // the id is free again
        f.hypervisor.set_delay(Duration::ZERO);
        f.service
            .create(
                SandboxSpec::builder()
                    .sandbox_id("sbx-4")
                    .template_id("tmpl-a")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_create_rolls_back() {
        let f = fixture();
        f.hypervisor.set_delay(Duration::from_secs(30));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), f.service.create(spec("sbx-8", true)))
                .await;
        assert!(abandoned.is_err());

        // the create task rolls back on its own, then frees the id
        wait_until(|| !f.service.is_pending("sbx-8")).await;

        let layout = f.host.host.layout("tmpl-a", "sbx-8").unwrap();
        assert!(!layout.instance_dir().exists());
        assert!(!layout.cgroup_path().exists());
        assert!(f.host.net.is_clean(), "left behind: {:?}", f.host.net.snapshot());
        assert_eq!(f.host.host.slots().in_use(), 0);
        assert!(f.host.host.dns().lookup("sbx-8").await.is_none());
        assert!(f.service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_deadline_waits_for_provisioning() {
        let f = fixture();
        let template = f.host.data_root().join("templates").join("tmpl-slow");
        std::fs::create_dir_all(&template).unwrap();
        let fifo = template.join("rootfs.ext4");
        nix::unistd::mkfifo(fifo.as_path(), nix::sys::stat::Mode::S_IRWXU).unwrap();

        // the copy blocks opening the base image until a writer shows up
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            tokio::task::spawn_blocking(move || std::fs::write(&fifo, b"late image"))
                .await
                .unwrap()
                .unwrap();
        });

        let spec = SandboxSpec::builder()
            .sandbox_id("sbx-slow")
            .template_id("tmpl-slow")
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let start = Instant::now();
        let err = f.service.create(spec).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(600));
        writer.await.unwrap();

        let layout = f.host.host.layout("tmpl-slow", "sbx-slow").unwrap();
        assert!(!layout.instance_dir().exists());
        assert_eq!(f.host.host.slots().in_use(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_create_is_not_an_orphan() {
        let f = fixture();
        f.hypervisor.publish_to(f.procs.clone());
        f.hypervisor.set_delay(Duration::from_millis(500));

        let service = &f.service;
        let (created, (orphans, purged_all, purged_named)) = tokio::join!(
            service.create(spec("sbx-1", true)),
            async {
                wait_until(|| f.procs.len() == 1).await;
                (
                    service.list_orphans().await.unwrap(),
                    service.purge_orphans(&[]).await.unwrap(),
                    service.purge_orphans(&["sbx-1".to_string()]).await.unwrap(),
                )
            }
        );

        assert!(orphans.is_empty());
        assert!(purged_all.is_empty());
        assert!(!purged_named[0].purged);
        assert!(purged_named[0]
            .error
            .as_deref()
            .unwrap()
            .contains("being created"));

        let sandbox = created.unwrap();
        assert!(f.procs.killed().is_empty());
        assert!(f.host.net.netns_exists(sandbox.network().netns()));
        assert!(service.list_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slots_exhausted() {
        let host = TestHost::with_config(|b| b.subnet("10.0.0.0/23".parse().unwrap()));
        for _ in 0..64 {
            host.host.slots().acquire().unwrap();
        }
        let service = SandboxService::new(
            host.host.clone(),
            Arc::new(FakeHypervisor::new()),
            Arc::new(FakeProcesses::new()),
        );
        let err = service.create(spec("sbx-5", true)).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
        assert!(!host.host.layout("tmpl-a", "sbx-5").unwrap().instance_dir().exists());
    }

    #[tokio::test]
    async fn test_delete_unknown() {
        let f = fixture();
        assert!(matches!(
            f.service.delete("ghost").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_reports_partial_failure_but_unregisters() {
        let f = fixture();
        let sandbox = f.service.create(spec("sbx-6", true)).await.unwrap();
        let netns = sandbox.network().netns().to_string();
        f.host
            .net
            .fail_when(|cmd| matches!(cmd, NetCommand::DelRoute { .. }));

        let err = f.service.delete("sbx-6").await.unwrap_err();
        match err {
            CoreError::PartialFailure(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!f.service.registry().contains("sbx-6").await);
        assert!(!f.host.net.netns_exists(&netns));
        assert!(!sandbox.layout().instance_dir().exists());
    }

    #[tokio::test]
    async fn test_delete_force_kills_stubborn_process() {
        let host = TestHost::with_config(|b| b.stop_timeout(Duration::from_millis(20)));
        let hypervisor = Arc::new(FakeHypervisor::new());
        hypervisor.stubborn();
        let service = SandboxService::new(host.host.clone(), hypervisor.clone(), Arc::new(FakeProcesses::new()));

        service.create(spec("sbx-7", true)).await.unwrap();
        service.delete("sbx-7").await.unwrap();
        assert_eq!(hypervisor.vms()[0].stop_calls(), 2);
    }

    #[tokio::test]
    async fn test_adopt_and_purge_orphans() {
        let f = fixture();
        let root = f.host.data_root();
        f.procs.add(500, &launcher_cmdline(&root, "tmpl-a", "old-1", 0));
        f.procs.add(501, &launcher_cmdline(&root, "tmpl-a", "old-2", 1));

        let adopted = f.service.adopt_orphan_slots().await.unwrap();
        assert_eq!(adopted.len(), 2);
        assert_eq!(f.host.host.slots().in_use(), 2);

        // new sandboxes skip the adopted slots
        let sandbox = f.service.create(spec("fresh", true)).await.unwrap();
        assert_eq!(sandbox.network().slot(), 2);

        let reports = f.service.purge_orphans(&[]).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.purged));
        let mut killed = f.procs.killed();
        killed.sort_unstable();
        assert_eq!(killed, vec![500, 501]);
        assert_eq!(f.host.host.slots().in_use(), 1);
        assert!(f.service.list_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_named_orphans() {
        let f = fixture();
        f.service.create(spec("live", true)).await.unwrap();
        f.procs.add(600, &launcher_cmdline(&f.host.data_root(), "tmpl-a", "old", 5));

        let reports = f
            .service
            .purge_orphans(&["old".to_string(), "live".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(reports[0].purged);
        assert!(!reports[1].purged);
        assert!(reports[1].error.as_deref().unwrap().contains("registered"));
        assert!(!reports[2].purged);
        assert_eq!(f.procs.killed(), vec![600]);
        assert!(f.service.registry().contains("live").await);
    }

    #[tokio::test]
    async fn test_purge_never_touches_registered_sandbox() {
        let f = fixture();
        let live = f.service.create(spec("sbx-1", true)).await.unwrap();
        let slot = live.network().slot();
        f.procs
            .add(777, &launcher_cmdline(&f.host.data_root(), "tmpl-a", "sbx-1", slot));

        // "sbx" is a substring of the live sandbox's launcher
        let reports = f.service.purge_orphans(&["sbx".to_string()]).await.unwrap();
        assert!(!reports[0].purged);
        assert!(reports[0].error.as_deref().unwrap().contains("sbx-1"));

        assert!(f.procs.killed().is_empty());
        assert!(f.service.registry().contains("sbx-1").await);
        assert!(f.host.net.netns_exists(live.network().netns()));
        assert!(live.layout().instance_dir().exists());
        assert!(f.host.host.dns().lookup("sbx-1").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let f = fixture();
        for i in 0..3 {
            f.service.create(spec(&format!("sbx-{i}"), i % 2 == 0)).await.unwrap();
        }
        f.service.shutdown().await.unwrap();
        assert!(f.service.registry().is_empty().await);
        assert!(f.host.net.is_clean());
        assert_eq!(f.host.host.slots().in_use(), 0);
        assert!(f.host.host.dns().is_empty().await);
    }
}
