//! Per-sandbox filesystem provisioning.
//!
//! A sandbox gets its own instance tree derived from the template images:
//! - overlay mode: the read-only base is hard-linked (shared inode) and
//!   the writable delta is cloned;
//! - full mode: the base image itself is cloned.
//!
//! "Clone" is a `FICLONE` reflink where the filesystem supports it and a
//! byte copy otherwise. Either way the result is a separate inode, so the
//! template images are never written through an instance path.

use crate::best_effort::BestEffort;
use crate::error::{CoreError, Result};
use crate::layout::ResourceLayout;
use serde::Serialize;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

// FICLONE = _IOW(0x94, 9, int)
nix::ioctl_write_int!(ficlone, 0x94, 9);

/// Materializes and removes sandbox instance trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemProvisioner;

impl FilesystemProvisioner {
    pub fn new() -> Self {
        Self
    }

    /// Create the instance tree and supporting directories for `layout`.
    ///
    /// Runs on the blocking pool; a failure leaves whatever was created for
    /// [`cleanup`](Self::cleanup) to remove.
    pub async fn provision(&self, layout: &ResourceLayout, overlay: bool) -> Result<()> {
        let layout = layout.clone();
        let start = std::time::Instant::now();
        tokio::task::spawn_blocking(move || provision_blocking(&layout, overlay).map(|()| layout))
            .await
            .map_err(|e| CoreError::Io(io::Error::other(e)))?
            .map(|layout| {
                tracing::debug!(
                    sandbox_id = %layout.sandbox_id(),
                    overlay,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Instance filesystem provisioned"
                );
            })
    }

    /// Remove the instance tree (unless `keep_instance_dir`), the socket and
    /// the metrics target. Every item is attempted; missing items count as
    /// removed.
    pub async fn cleanup(&self, layout: &ResourceLayout, keep_instance_dir: bool) -> Result<()> {
        let mut steps = BestEffort::new("filesystem cleanup", layout.sandbox_id());

        if !keep_instance_dir {
            let dir = layout.instance_dir();
            steps.record(
                "remove instance dir",
                absent_ok("remove", &dir, tokio::fs::remove_dir_all(&dir).await),
            );
        }

        let socket = layout.socket_path();
        steps.record(
            "remove socket",
            absent_ok("remove", &socket, tokio::fs::remove_file(&socket).await),
        );

        let target = layout.metrics_target();
        steps.record(
            "remove metrics target",
            absent_ok("remove", &target, tokio::fs::remove_file(&target).await),
        );

        steps.finish()
    }

    /// Write a Prometheus file_sd descriptor pointing at `address`.
    pub async fn write_metrics_target(&self, layout: &ResourceLayout, address: SocketAddr) -> Result<()> {
        let descriptor = [MetricsTarget {
            targets: vec![address.to_string()],
            labels: MetricsLabels {
                sandbox_id: layout.sandbox_id(),
                template_id: layout.template_id(),
            },
        }];
        let json = serde_json::to_vec_pretty(&descriptor)?;

        let path = layout.metrics_target();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::path("create", parent, e))?;
        }
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| CoreError::path("write", &path, e))?;
        tracing::trace!(sandbox_id = %layout.sandbox_id(), path = %path.display(), "Metrics target written");
        Ok(())
    }
}

#[derive(Serialize)]
struct MetricsTarget<'a> {
    targets: Vec<String>,
    labels: MetricsLabels<'a>,
}

#[derive(Serialize)]
struct MetricsLabels<'a> {
    sandbox_id: &'a str,
    template_id: &'a str,
}

fn provision_blocking(layout: &ResourceLayout, overlay: bool) -> Result<()> {
    // the host kernel is bind-mounted over this file inside the private mount
    create_file_and_dirs(&layout.kernel_placeholder())?;

    let mut dirs = vec![layout.private_dir(), layout.socket_dir()];
    if let Some(parent) = layout.metrics_target().parent() {
        dirs.push(parent.to_path_buf());
    }
    for dir in &dirs {
        create_dirs(dir)?;
    }

    if overlay {
        clone_or_copy(&layout.base_writable_rootfs(), &layout.instance_writable_rootfs())?;
        let (base, instance) = (layout.base_rootfs(), layout.instance_rootfs());
        std::fs::hard_link(&base, &instance).map_err(|e| CoreError::path("hard-link", &base, e))?;
    } else {
        clone_or_copy(&layout.base_rootfs(), &layout.instance_rootfs())?;
    }
    Ok(())
}

fn create_dirs(dir: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| CoreError::path("create", dir, e))
}

fn create_file_and_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dirs(parent)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|e| CoreError::path("create", path, e))?;
    Ok(())
}

/// Clone `src` into a new file at `dst`, falling back to a byte copy.
fn clone_or_copy(src: &Path, dst: &Path) -> Result<()> {
    let source = File::open(src).map_err(|e| CoreError::path("open", src, e))?;
    let target = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .open(dst)
        .map_err(|e| CoreError::path("create", dst, e))?;

    // SAFETY: both descriptors are open for the duration of the call
    match unsafe { ficlone(target.as_raw_fd(), source.as_raw_fd() as _) } {
        Ok(_) => {
            tracing::trace!(src = %src.display(), dst = %dst.display(), "Reflinked");
            return Ok(());
        }
        Err(errno) => {
            tracing::debug!(src = %src.display(), error = %errno, "Reflink unavailable, copying");
        }
    }

    let copied = io::copy(&mut &source, &mut &target).and_then(|_| target.sync_all());
    if let Err(e) = copied {
        if let Err(remove_err) = std::fs::remove_file(dst) {
            tracing::warn!(dst = %dst.display(), error = %remove_err, "Failed to remove partial copy");
        }
        return Err(CoreError::path("copy", src, e));
    }
    Ok(())
}

fn absent_ok(op: &'static str, path: &Path, result: io::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::path(op, path, e)),
    }
}
