//! Launcher command line.
//!
//! Every hypervisor runs as
//!
//! ```text
//! unshare --fork --kill-child -m -- sh -c '<script>'
//! ```
//!
//! where the script joins the sandbox cgroup, makes the new mount namespace
//! private, applies the bind mounts and finally
//! `exec ip netns exec <netns> <firecracker> --api-sock <socket>`.
//! The `unshare` parent keeps this full command line for the life of the
//! sandbox, which is what orphan recovery matches against after a restart.

use crate::config::LaunchConfig;
use std::path::Path;

/// Program every launcher command line starts with.
pub const LAUNCHER_PROGRAM: &str = "unshare";

/// Fragment identifying the network namespace wrapper.
pub const NETNS_EXEC: &str = "ip netns exec";

/// Quote a string for `sh`.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Render the `sh -c` script run inside the private mount namespace.
pub fn launch_script(config: &LaunchConfig) -> String {
    let mut steps = Vec::new();

    if let Some(procs) = &config.cgroup_procs {
        steps.push(format!("echo $$ > {}", quote_path(procs)));
    }

    steps.push("mount --make-rprivate /".to_string());

    for mount in &config.mounts {
        steps.push(format!(
            "mount --bind {} {}",
            quote_path(&mount.source),
            quote_path(&mount.target)
        ));
    }

    steps.push(format!(
        "exec {} {} {} --api-sock {}",
        NETNS_EXEC,
        quote(&config.netns),
        quote_path(&config.firecracker_path),
        quote_path(&config.socket_path)
    ));

    steps.join(" && ")
}

/// Full argv of the launcher process.
pub fn launch_argv(config: &LaunchConfig) -> Vec<String> {
    vec![
        LAUNCHER_PROGRAM.to_string(),
        "--fork".to_string(),
        "--kill-child".to_string(),
        "-m".to_string(),
        "--".to_string(),
        "sh".to_string(),
        "-c".to_string(),
        launch_script(config),
    ]
}
