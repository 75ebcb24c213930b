//! Sandbox identity and the on-disk paths derived from it.
//!
//! ```text
//! <data_root>/
//!   templates/<template>/rootfs.ext4            base image, never written
//!   templates/<template>/writable-rootfs.ext4   base writable delta
//!   templates/<template>/run/                   private mount point
//!   instances/<template>/<sandbox>/             per-sandbox tree
//!   sockets/<sandbox>.sock                      hypervisor API socket
//!   prometheus-targets/<template>/<sandbox>.json
//! <cgroup_root>/<cgroup_name>/<sandbox>/
//! ```

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding template images.
pub const TEMPLATES_DIR: &str = "templates";
/// Directory holding per-sandbox instance trees.
pub const INSTANCES_DIR: &str = "instances";
/// Directory holding hypervisor API sockets.
pub const SOCKETS_DIR: &str = "sockets";
/// Directory holding Prometheus file_sd targets.
pub const METRICS_TARGETS_DIR: &str = "prometheus-targets";
/// Mount point for the instance tree inside the private mount namespace.
pub const PRIVATE_DIR: &str = "run";

/// Read-only root filesystem image name.
pub const ROOTFS_NAME: &str = "rootfs.ext4";
/// Writable delta image name.
pub const WRITABLE_ROOTFS_NAME: &str = "writable-rootfs.ext4";
/// Kernel image name inside the private mount.
pub const KERNEL_NAME: &str = "vmlinux";

const MAX_ID_LEN: usize = 64;

/// Check a template or sandbox id against `^[A-Za-z0-9_-]{1,64}$`.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(CoreError::Validation(format!(
            "{kind} must be 1-{MAX_ID_LEN} characters, got {}",
            id.len()
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(CoreError::Validation(format!(
            "{kind} '{id}' contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Immutable identity of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIdentity {
    template_id: String,
    sandbox_id: String,
    data_root: PathBuf,
}

impl SandboxIdentity {
    /// Validate both ids and build the identity.
    pub fn new(
        template_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        data_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let template_id = template_id.into();
        let sandbox_id = sandbox_id.into();
        validate_id("template_id", &template_id)?;
        validate_id("sandbox_id", &sandbox_id)?;
        Ok(Self {
            template_id,
            sandbox_id,
            data_root: data_root.into(),
        })
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}

/// Every path a sandbox owns or reads, as pure functions of its identity.
///
/// Paths are injective in the sandbox id for a fixed template and data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLayout {
    identity: SandboxIdentity,
    cgroup_parent: PathBuf,
}

impl ResourceLayout {
    /// `cgroup_root` is the cgroupfs mount, `cgroup_name` the parent group
    /// under it (may itself be nested, e.g. `skerry/sandboxes`).
    pub fn new(identity: SandboxIdentity, cgroup_root: &Path, cgroup_name: &str) -> Self {
        Self {
            identity,
            cgroup_parent: cgroup_root.join(cgroup_name),
        }
    }

    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    pub fn sandbox_id(&self) -> &str {
        self.identity.sandbox_id()
    }

    pub fn template_id(&self) -> &str {
        self.identity.template_id()
    }

    fn root(&self) -> &Path {
        self.identity.data_root()
    }

    /// `templates/<template>/`
    pub fn template_dir(&self) -> PathBuf {
        self.root().join(TEMPLATES_DIR).join(self.template_id())
    }

    pub fn base_rootfs(&self) -> PathBuf {
        self.template_dir().join(ROOTFS_NAME)
    }

    pub fn base_writable_rootfs(&self) -> PathBuf {
        self.template_dir().join(WRITABLE_ROOTFS_NAME)
    }

    /// Where the instance tree is bind-mounted for the hypervisor.
    pub fn private_dir(&self) -> PathBuf {
        self.template_dir().join(PRIVATE_DIR)
    }

    /// Kernel mount point inside [`private_dir`](Self::private_dir).
    pub fn private_kernel(&self) -> PathBuf {
        self.private_dir().join(KERNEL_NAME)
    }

    /// `instances/<template>/<sandbox>/`
    pub fn instance_dir(&self) -> PathBuf {
        self.root()
            .join(INSTANCES_DIR)
            .join(self.template_id())
            .join(self.sandbox_id())
    }

    pub fn instance_rootfs(&self) -> PathBuf {
        self.instance_dir().join(ROOTFS_NAME)
    }

    pub fn instance_writable_rootfs(&self) -> PathBuf {
        self.instance_dir().join(WRITABLE_ROOTFS_NAME)
    }

    /// Empty file that the host kernel gets bind-mounted over.
    pub fn kernel_placeholder(&self) -> PathBuf {
        self.instance_dir().join(KERNEL_NAME)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.root().join(SOCKETS_DIR)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir().join(format!("{}.sock", self.sandbox_id()))
    }

    pub fn metrics_target(&self) -> PathBuf {
        self.root()
            .join(METRICS_TARGETS_DIR)
            .join(self.template_id())
            .join(format!("{}.json", self.sandbox_id()))
    }

    /// `<cgroup_root>/<cgroup_name>/<sandbox>`
    pub fn cgroup_path(&self) -> PathBuf {
        self.cgroup_parent.join(self.sandbox_id())
    }

    pub fn cgroup_procs(&self) -> PathBuf {
        self.cgroup_path().join("cgroup.procs")
    }
}
