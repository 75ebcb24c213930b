//! Per-sandbox network namespace wiring.
//!
//! ```text
//!  host                                │ netns <sandbox>-<slot>
//!                                      │
//!  uplink ◀─MASQ── vethN (veth_ip) ◀───┼──▶ vpeerN (vpeer_ip)
//!                   route host_cloned  │      SNAT guest → host_cloned
//!                   via vpeer_ip       │      DNAT host_cloned → guest
//!                                      │    tap0 169.254.0.22/30 ── guest .21
//! ```
//!
//! Every host change is a typed [`NetCommand`] executed through the
//! [`HostNetwork`] seam; [`IpRoute2`] runs them as `ip` / `iptables`.

use crate::address::{self, AddressPlan, Ipv4Cidr};
use crate::best_effort::BestEffort;
use crate::dns::DnsRegistry;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Tap device inside every sandbox namespace.
pub const TAP_NAME: &str = "tap0";
/// Host side of the guest link.
pub const TAP_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 22);
/// Guest side of the guest link.
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 21);
/// Prefix of the guest link.
pub const TAP_PREFIX: u8 = 30;

/// Addressing and names for one sandbox's network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEnv {
    plan: AddressPlan,
    netns: String,
}

impl NetworkEnv {
    pub fn new(sandbox_id: &str, plan: AddressPlan) -> Self {
        Self {
            netns: format!("{sandbox_id}-{}", plan.slot),
            plan,
        }
    }

    /// Derive the environment for `slot` inside `subnet`.
    pub fn for_slot(sandbox_id: &str, slot: u32, subnet: &Ipv4Cidr) -> Result<Self> {
        Ok(Self::new(sandbox_id, address::plan(slot, subnet)?))
    }

    /// Split a namespace name back into sandbox id and slot.
    ///
    /// The slot is the suffix after the last `-`, so sandbox ids may
    /// themselves contain dashes.
    pub fn parse_netns(name: &str) -> Option<(&str, u32)> {
        let (sandbox_id, slot) = name.rsplit_once('-')?;
        if sandbox_id.is_empty() {
            return None;
        }
        Some((sandbox_id, slot.parse().ok()?))
    }

    pub fn plan(&self) -> &AddressPlan {
        &self.plan
    }

    pub fn slot(&self) -> u32 {
        self.plan.slot
    }

    pub fn netns(&self) -> &str {
        &self.netns
    }

    pub fn veth_name(&self) -> String {
        format!("veth{}", self.plan.slot)
    }

    pub fn vpeer_name(&self) -> String {
        format!("vpeer{}", self.plan.slot)
    }

    pub fn veth_ip(&self) -> Ipv4Addr {
        self.plan.veth_ip
    }

    pub fn vpeer_ip(&self) -> Ipv4Addr {
        self.plan.vpeer_ip
    }

    pub fn host_cloned_ip(&self) -> Ipv4Addr {
        self.plan.host_cloned_ip
    }
}

/// Append or delete an iptables rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IptablesAction {
    Append,
    Delete,
}

impl IptablesAction {
    fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// A rule identified by table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl IptablesRule {
    fn new(table: &'static str, chain: &'static str, args: &[&str]) -> Self {
        Self {
            table,
            chain,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// One host networking change.
///
/// `netns: Some(ns)` scopes the command to that namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetCommand {
    AddNetns {
        name: String,
    },
    DelNetns {
        name: String,
    },
    /// Create a veth pair with `peer` moved into `peer_netns`.
    AddVethPair {
        host: String,
        peer: String,
        peer_netns: String,
    },
    DelLink {
        netns: Option<String>,
        name: String,
    },
    AddTap {
        netns: String,
        name: String,
    },
    AddAddr {
        netns: Option<String>,
        dev: String,
        cidr: String,
    },
    LinkUp {
        netns: Option<String>,
        dev: String,
    },
    AddRoute {
        netns: Option<String>,
        dest: String,
        via: Ipv4Addr,
    },
    DelRoute {
        netns: Option<String>,
        dest: String,
        via: Ipv4Addr,
    },
    Iptables {
        netns: Option<String>,
        action: IptablesAction,
        rule: IptablesRule,
    },
}

impl NetCommand {
    fn netns(&self) -> Option<&str> {
        match self {
            Self::AddNetns { .. } | Self::DelNetns { .. } | Self::AddVethPair { .. } => None,
            Self::AddTap { netns, .. } => Some(netns),
            Self::DelLink { netns, .. }
            | Self::AddAddr { netns, .. }
            | Self::LinkUp { netns, .. }
            | Self::AddRoute { netns, .. }
            | Self::DelRoute { netns, .. }
            | Self::Iptables { netns, .. } => netns.as_deref(),
        }
    }

    /// Whether this command removes something, so "already gone" is success.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Self::DelNetns { .. }
                | Self::DelLink { .. }
                | Self::DelRoute { .. }
                | Self::Iptables {
                    action: IptablesAction::Delete,
                    ..
                }
        )
    }

    /// The full command line, including any `ip netns exec` prefix.
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        if let Some(ns) = self.netns() {
            argv.extend(["ip", "netns", "exec", ns].map(String::from));
        }

        let own: Vec<&str> = match self {
            Self::AddNetns { name } => vec!["ip", "netns", "add", name.as_str()],
            Self::DelNetns { name } => vec!["ip", "netns", "delete", name.as_str()],
            Self::AddVethPair {
                host,
                peer,
                peer_netns,
            } => vec![
                "ip",
                "link",
                "add",
                host.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                peer.as_str(),
                "netns",
                peer_netns.as_str(),
            ],
            Self::DelLink { name, .. } => vec!["ip", "link", "delete", name.as_str()],
            Self::AddTap { name, .. } => {
                vec!["ip", "tuntap", "add", "dev", name.as_str(), "mode", "tap"]
            }
            Self::AddAddr { dev, cidr, .. } => {
                vec!["ip", "addr", "add", cidr.as_str(), "dev", dev.as_str()]
            }
            Self::LinkUp { dev, .. } => vec!["ip", "link", "set", dev.as_str(), "up"],
            Self::AddRoute { dest, .. } => vec!["ip", "route", "add", dest.as_str(), "via"],
            Self::DelRoute { dest, .. } => vec!["ip", "route", "del", dest.as_str(), "via"],
            Self::Iptables { action, rule, .. } => {
                let mut v = vec!["iptables", "-t", rule.table, action.flag(), rule.chain];
                v.extend(rule.args.iter().map(String::as_str));
                v
            }
        };
        argv.extend(own.into_iter().map(String::from));

        if let Self::AddRoute { via, .. } | Self::DelRoute { via, .. } = self {
            argv.push(via.to_string());
        }
        argv
    }
}

impl fmt::Display for NetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Executes host networking changes.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Apply one change. Removing something that does not exist succeeds.
    async fn run(&self, cmd: &NetCommand) -> Result<()>;
}

/// Runs commands with the `ip` and `iptables` binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRoute2;

// stderr fragments meaning "the thing being removed is already gone"
const ABSENT_MARKERS: &[&str] = &[
    "Cannot find device",
    "No such file or directory",
    "No such process",
    "does a matching rule exist",
    "Cannot open network namespace",
];

fn is_absent(stderr: &str) -> bool {
    ABSENT_MARKERS.iter().any(|m| stderr.contains(m))
}

#[async_trait]
impl HostNetwork for IpRoute2 {
    async fn run(&self, cmd: &NetCommand) -> Result<()> {
        let argv = cmd.argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CoreError::Validation("empty command".into()))?;

        tracing::trace!(command = %cmd, "Running host command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CoreError::path("spawn", program, e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if cmd.is_removal() && is_absent(&stderr) {
            tracing::debug!(command = %cmd, "Already absent");
            return Ok(());
        }
        Err(CoreError::Command {
            command: cmd.to_string(),
            status: output.status.to_string(),
            stderr,
        })
    }
}

/// Creates and destroys the network of one sandbox.
#[derive(Clone)]
pub struct NetworkWiring {
    host: Arc<dyn HostNetwork>,
    dns: Arc<DnsRegistry>,
    uplink: String,
}

impl fmt::Debug for NetworkWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkWiring")
            .field("uplink", &self.uplink)
            .finish_non_exhaustive()
    }
}

fn cidr(ip: Ipv4Addr, prefix: u8) -> String {
    format!("{ip}/{prefix}")
}

impl NetworkWiring {
    pub fn new(host: Arc<dyn HostNetwork>, dns: Arc<DnsRegistry>, uplink: impl Into<String>) -> Self {
        Self {
            host,
            dns,
            uplink: uplink.into(),
        }
    }

    pub fn dns(&self) -> &Arc<DnsRegistry> {
        &self.dns
    }

    /// Host-side firewall rules for `env`, without action.
    pub fn host_rules(&self, env: &NetworkEnv) -> Vec<IptablesRule> {
        let veth = env.veth_name();
        let uplink = self.uplink.as_str();
        let source = env.plan().host_cloned_cidr().to_string();
        vec![
            IptablesRule::new("filter", "FORWARD", &["-i", veth.as_str(), "-o", uplink, "-j", "ACCEPT"]),
            IptablesRule::new("filter", "FORWARD", &["-i", uplink, "-o", veth.as_str(), "-j", "ACCEPT"]),
            IptablesRule::new(
                "nat",
                "POSTROUTING",
                &["-s", source.as_str(), "-o", uplink, "-j", "MASQUERADE"],
            ),
        ]
    }

    /// Commands that build the network for `env`, in order.
    pub fn setup_commands(&self, env: &NetworkEnv) -> Vec<NetCommand> {
        let ns = env.netns().to_string();
        let scoped = Some(ns.clone());
        let (veth, vpeer) = (env.veth_name(), env.vpeer_name());
        let host_cloned = env.host_cloned_ip().to_string();
        let guest = GUEST_IP.to_string();

        let mut cmds = vec![
            NetCommand::AddNetns { name: ns.clone() },
            NetCommand::AddVethPair {
                host: veth.clone(),
                peer: vpeer.clone(),
                peer_netns: ns.clone(),
            },
            NetCommand::AddAddr {
                netns: None,
                dev: veth.clone(),
                cidr: cidr(env.veth_ip(), address::VETH_PREFIX),
            },
            NetCommand::LinkUp {
                netns: None,
                dev: veth.clone(),
            },
            NetCommand::AddAddr {
                netns: scoped.clone(),
                dev: vpeer.clone(),
                cidr: cidr(env.vpeer_ip(), address::VETH_PREFIX),
            },
            NetCommand::LinkUp {
                netns: scoped.clone(),
                dev: vpeer.clone(),
            },
            NetCommand::LinkUp {
                netns: scoped.clone(),
                dev: "lo".into(),
            },
            NetCommand::AddTap {
                netns: ns.clone(),
                name: TAP_NAME.into(),
            },
            NetCommand::AddAddr {
                netns: scoped.clone(),
                dev: TAP_NAME.into(),
                cidr: cidr(TAP_IP, TAP_PREFIX),
            },
            NetCommand::LinkUp {
                netns: scoped.clone(),
                dev: TAP_NAME.into(),
            },
            NetCommand::AddRoute {
                netns: scoped.clone(),
                dest: "default".into(),
                via: env.veth_ip(),
            },
            NetCommand::Iptables {
                netns: scoped.clone(),
                action: IptablesAction::Append,
                rule: IptablesRule::new(
                    "nat",
                    "POSTROUTING",
                    &[
                        "-o",
                        vpeer.as_str(),
                        "-s",
                        guest.as_str(),
                        "-j",
                        "SNAT",
                        "--to",
                        host_cloned.as_str(),
                    ],
                ),
            },
            NetCommand::Iptables {
                netns: scoped,
                action: IptablesAction::Append,
                rule: IptablesRule::new(
                    "nat",
                    "PREROUTING",
                    &[
                        "-i",
                        vpeer.as_str(),
                        "-d",
                        host_cloned.as_str(),
                        "-j",
                        "DNAT",
                        "--to",
                        guest.as_str(),
                    ],
                ),
            },
            NetCommand::AddRoute {
                netns: None,
                dest: env.plan().host_cloned_cidr().to_string(),
                via: env.vpeer_ip(),
            },
        ];
        cmds.extend(self.host_rules(env).into_iter().map(|rule| NetCommand::Iptables {
            netns: None,
            action: IptablesAction::Append,
            rule,
        }));
        cmds
    }

    /// Independent removal steps for `env`, each paired with a label.
    pub fn teardown_commands(&self, env: &NetworkEnv) -> Vec<(&'static str, NetCommand)> {
        let mut cmds = vec![
            (
                "delete netns",
                NetCommand::DelNetns {
                    name: env.netns().to_string(),
                },
            ),
            (
                "delete host veth",
                NetCommand::DelLink {
                    netns: None,
                    name: env.veth_name(),
                },
            ),
        ];
        cmds.extend(self.host_rules(env).into_iter().map(|rule| {
            (
                "delete firewall rule",
                NetCommand::Iptables {
                    netns: None,
                    action: IptablesAction::Delete,
                    rule,
                },
            )
        }));
        cmds.push((
            "delete host route",
            NetCommand::DelRoute {
                netns: None,
                dest: env.plan().host_cloned_cidr().to_string(),
                via: env.vpeer_ip(),
            },
        ));
        cmds
    }

    /// Build the namespace, links, routes, rules and DNS record for `env`.
    ///
    /// On failure whatever was created is torn down again before the
    /// error is returned.
    pub async fn setup(&self, env: &NetworkEnv, sandbox_id: &str) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::debug!(sandbox_id, netns = env.netns(), slot = env.slot(), "Wiring network");

        if let Err(e) = self.apply(env, sandbox_id).await {
            tracing::error!(sandbox_id, netns = env.netns(), error = %e, "Network setup failed, rolling back");
            if let Err(rollback) = self.teardown(env, sandbox_id).await {
                tracing::warn!(sandbox_id, error = %rollback, "Network rollback incomplete");
            }
            return Err(e);
        }

        tracing::info!(
            sandbox_id,
            netns = env.netns(),
            host_cloned_ip = %env.host_cloned_ip(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Network ready"
        );
        Ok(())
    }

    async fn apply(&self, env: &NetworkEnv, sandbox_id: &str) -> Result<()> {
        for cmd in self.setup_commands(env) {
            self.host.run(&cmd).await?;
        }
        self.dns.add(sandbox_id, env.host_cloned_ip()).await
    }

    /// Remove everything [`setup`](Self::setup) creates. Every step is
    /// attempted; already-absent pieces count as removed.
    pub async fn teardown(&self, env: &NetworkEnv, sandbox_id: &str) -> Result<()> {
        let mut steps = BestEffort::new("network teardown", sandbox_id);
        for (label, cmd) in self.teardown_commands(env) {
            steps.record(label, self.host.run(&cmd).await);
        }
        steps.record("delete DNS record", self.dns.remove(sandbox_id).await);
        let result = steps.finish();
        if result.is_ok() {
            tracing::debug!(sandbox_id, netns = env.netns(), "Network torn down");
        }
        result
    }
}
