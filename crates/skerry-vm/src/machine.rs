//! Hypervisor launcher and process handle.

use crate::api;
use crate::command::launch_argv;
use crate::config::LaunchConfig;
use crate::error::{Result, VmError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long the launcher waits for the API socket to appear.
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between socket existence checks.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Current state of a hypervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Process spawned, guest not yet started
    Starting,
    /// Guest is running
    Running,
    /// Stop signal sent
    Stopping,
    /// Process has exited and been reaped
    Exited,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Exited => write!(f, "exited"),
        }
    }
}

/// Handle to a running hypervisor process.
///
/// `stop` only delivers the signal; `wait` reaps the process. Callers that
/// stop many processes send all signals first and wait afterwards.
#[async_trait]
pub trait VmProcess: Send + Sync {
    /// Pid of the launcher process, if known.
    fn pid(&self) -> Option<u32>;

    /// Current state.
    fn state(&self) -> VmState;

    /// Signal the process to stop. Stopping an exited process is a no-op.
    async fn stop(&self) -> Result<()>;

    /// Wait for the process to exit, returning its exit code if it had one.
    async fn wait(&self) -> Result<Option<i32>>;
}

/// Something that can start hypervisor processes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Start a process for `config` and bring the guest up.
    async fn launch(&self, config: LaunchConfig) -> Result<Box<dyn VmProcess>>;
}

/// Firecracker launched through `unshare` + `ip netns exec`.
#[derive(Debug, Clone)]
pub struct Firecracker {
    socket_timeout: Duration,
}

impl Default for Firecracker {
    fn default() -> Self {
        Self::new(SOCKET_WAIT_TIMEOUT)
    }
}

impl Firecracker {
    /// Create a launcher that waits `socket_timeout` for the API socket.
    pub fn new(socket_timeout: Duration) -> Self {
        Self { socket_timeout }
    }
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::trace!(
                path = %path.display(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "API socket ready"
            );
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(VmError::Timeout(timeout));
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Hypervisor for Firecracker {
    async fn launch(&self, config: LaunchConfig) -> Result<Box<dyn VmProcess>> {
        config.validate()?;
        let start = std::time::Instant::now();

        // A stale socket from a previous run would satisfy the readiness check
        match tokio::fs::remove_file(&config.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let argv = launch_argv(&config);
        tracing::debug!(vm_id = %config.vm_id, netns = %config.netns, "Spawning hypervisor");
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmError::Spawn(format!("{}: {e}", argv[0])))?;

        let process = FirecrackerProcess::new(config.vm_id.clone(), child);

        let ready = async {
            wait_for_socket(&config.socket_path, self.socket_timeout).await?;
            api::configure(&config.socket_path, &config).await?;
            api::start_instance(&config.socket_path).await
        };

        if let Err(e) = ready.await {
            tracing::error!(vm_id = %config.vm_id, error = %e, "Hypervisor failed to start, killing it");
            if let Err(stop_err) = process.stop().await {
                tracing::warn!(vm_id = %config.vm_id, error = %stop_err, "Failed to signal hypervisor");
            }
            if let Err(wait_err) = process.wait().await {
                tracing::warn!(vm_id = %config.vm_id, error = %wait_err, "Failed to reap hypervisor");
            }
            return Err(e);
        }

        process.set_state(VmState::Running);
        tracing::info!(
            vm_id = %config.vm_id,
            pid = process.pid(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Hypervisor started"
        );
        Ok(Box::new(process))
    }
}

/// A spawned Firecracker launcher process.
pub struct FirecrackerProcess {
    vm_id: String,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    state: Mutex<VmState>,
}

impl FirecrackerProcess {
    fn new(vm_id: String, child: Child) -> Self {
        Self {
            vm_id,
            pid: child.id(),
            child: tokio::sync::Mutex::new(child),
            state: Mutex::new(VmState::Starting),
        }
    }

    fn set_state(&self, state: VmState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl VmProcess for FirecrackerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn state(&self) -> VmState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stop(&self) -> Result<()> {
        if self.state() == VmState::Exited {
            return Ok(());
        }
        self.set_state(VmState::Stopping);

        let Some(pid) = self.pid else {
            return Ok(());
        };

        // Signalling by pid keeps `stop` usable while another task is in `wait`.
        // `--kill-child` takes the hypervisor down with the launcher.
        tracing::debug!(vm_id = %self.vm_id, pid, "Killing hypervisor");
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(VmError::Signal { pid, source }),
        }
    }

    async fn wait(&self) -> Result<Option<i32>> {
        let status = self.child.lock().await.wait().await?;
        self.set_state(VmState::Exited);
        tracing::debug!(vm_id = %self.vm_id, status = %status, "Hypervisor exited");
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Starting.to_string(), "starting");
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Stopping.to_string(), "stopping");
        assert_eq!(VmState::Exited.to_string(), "exited");
    }

    #[tokio::test]
    async fn test_wait_for_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let result = wait_for_socket(&dir.path().join("fc.sock"), Duration::from_millis(30)).await;
        assert!(matches!(result, Err(VmError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_socket_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(wait_for_socket(&path, Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_process_stop_and_wait() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let process = FirecrackerProcess::new("sbx".into(), child);
        assert!(process.pid().is_some());
        assert_eq!(process.state(), VmState::Starting);

        process.stop().await.unwrap();
        assert_eq!(process.state(), VmState::Stopping);

        let code = process.wait().await.unwrap();
        assert_eq!(code, None); // killed by signal
        assert_eq!(process.state(), VmState::Exited);

        // stopping an exited process is a no-op
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_config() {
        let result = Firecracker::default().launch(LaunchConfig::default()).await;
        assert!(matches!(result, Err(VmError::Config(_))));
    }
}
