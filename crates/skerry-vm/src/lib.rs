//! # skerry-vm
//!
//! Hypervisor process layer for skerry sandboxes.
//! Starts Firecracker inside a private mount namespace and a sandbox network
//! namespace, configures it over its API socket, and hands back a process
//! handle that can be stopped, waited on and killed.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skerry_vm::{Firecracker, LaunchBuilder, VmState};
//!
//! # async fn example() -> skerry_vm::Result<()> {
//! let process = LaunchBuilder::new("sbx-1")
//!     .netns("sbx-1-0")
//!     .socket("/var/lib/skerry/sockets/sbx-1.sock")
//!     .kernel("/var/lib/skerry/templates/base/run/vmlinux")
//!     .rootfs("/var/lib/skerry/templates/base/run/rootfs.ext4")
//!     .launch(&Firecracker::default())
//!     .await?;
//!
//! assert_eq!(process.state(), VmState::Running);
//!
//! process.stop().await?;
//! process.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
mod builder;
pub mod command;
mod config;
mod error;
mod machine;

pub use builder::LaunchBuilder;
pub use config::{BindMount, DriveConfig, LaunchConfig, NetworkConfig, DEFAULT_BOOT_ARGS};
pub use error::{Result, VmError};
pub use machine::{Firecracker, FirecrackerProcess, Hypervisor, VmProcess, VmState, SOCKET_WAIT_TIMEOUT};
