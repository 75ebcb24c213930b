//! # skerry-server
//!
//! Daemon exposing skerry sandboxes over HTTP/JSON.
//!
//! ## Quick Start
//!
//! Run the server with default configuration (needs root for `ip netns`
//! and cgroups):
//!
//! ```bash
//! cargo run -p skerry-server
//! ```
//!
//! Configure via environment variables:
//!
//! ```bash
//! export SKERRY_DATA_ROOT=/var/lib/skerry
//! export SKERRY_KERNEL=/var/lib/skerry/kernels/vmlinux
//! export SKERRY_FIRECRACKER=/usr/local/bin/firecracker
//! export SKERRY_UPLINK=eth0
//! cargo run -p skerry-server
//! ```
//!
//! ## API
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /sandboxes` | Create a sandbox from a template |
//! | `GET /sandboxes` | List live sandboxes |
//! | `GET /sandboxes/:id` | Inspect one sandbox |
//! | `DELETE /sandboxes/:id` | Stop and tear down a sandbox |
//! | `GET /orphans` | Hypervisors the registry does not know |
//! | `POST /orphans/purge` | Kill orphans and release their resources |

mod config;
pub mod http;
mod server;
mod types;

pub use config::{ConfigError, ServerConfig};
pub use server::SkerryServer;
pub use types::*;
