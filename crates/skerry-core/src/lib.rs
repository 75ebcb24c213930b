//! # skerry-core
//!
//! Sandbox lifecycle for skerry on a single host.
//!
//! Each sandbox is one hypervisor process with its own network namespace,
//! instance filesystem tree and cgroup. This crate allocates those
//! resources, wires them together, tracks live sandboxes and recovers
//! hypervisors left behind by a previous run.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      SandboxService                         │
//! │   create / delete / list / list_orphans / purge_orphans     │
//! ├──────────────┬──────────────────────┬──────────────────────┤
//! │ SandboxReg.  │    HostResources     │   OrphanRecovery     │
//! │ id → Sandbox │ ┌──────────────────┐ │  /proc scan, kill    │
//! │              │ │ SlotPool         │ │                      │
//! │              │ │ NetworkWiring ───┼─┼─▶ HostNetwork (ip)   │
//! │              │ │   └ DnsRegistry  │ │                      │
//! │              │ │ Filesystem       │ │                      │
//! │              │ │ cgroup           │ │                      │
//! │              │ └──────────────────┘ │                      │
//! └──────────────┴──────────┬───────────┴──────────────────────┘
//!                           ▼
//!                skerry-vm: Hypervisor / VmProcess
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use skerry_core::{HostConfig, IpRoute2, ProcFs, SandboxService, SandboxSpec};
//! use skerry_vm::Firecracker;
//! use std::sync::Arc;
//!
//! # async fn example() -> skerry_core::Result<()> {
//! let service = SandboxService::from_config(
//!     HostConfig::default(),
//!     Arc::new(IpRoute2),
//!     Arc::new(Firecracker::default()),
//!     Arc::new(ProcFs::default()),
//! )?;
//!
//! let spec = SandboxSpec::builder()
//!     .sandbox_id("sbx-1")
//!     .template_id("base")
//!     .overlay(true)
//!     .build()?;
//! let sandbox = service.create(spec).await?;
//! println!("{} reachable at {}", sandbox.id(), sandbox.network().host_cloned_ip());
//!
//! service.delete("sbx-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
mod best_effort;
pub mod cgroup;
mod config;
mod dns;
mod error;
pub mod fs;
mod host;
pub mod layout;
pub mod network;
pub mod orphan;
mod registry;
mod retry;
mod sandbox;
mod service;
mod slots;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{AddressPlan, Ipv4Cidr, DEFAULT_SUBNET};
pub use best_effort::BestEffort;
pub use config::{HostConfig, HostConfigBuilder, ResourceLimits, SandboxSpec, SandboxSpecBuilder};
pub use dns::DnsRegistry;
pub use error::{CoreError, Failures, Result};
pub use fs::FilesystemProvisioner;
pub use host::{HostResources, Release};
pub use layout::{ResourceLayout, SandboxIdentity};
pub use network::{HostNetwork, IpRoute2, NetCommand, NetworkEnv, NetworkWiring};
pub use orphan::{HostProcesses, OrphanRecovery, ProcFs, ProcessEntry, SandboxInfo};
pub use registry::SandboxRegistry;
pub use retry::{retry_with_schedule, CGROUP_REMOVE_SCHEDULE};
pub use sandbox::{Sandbox, SandboxSummary};
pub use service::{PurgeReport, SandboxService, WRITABLE_DRIVE_ID};
pub use slots::SlotPool;
