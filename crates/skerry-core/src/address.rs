//! Deterministic per-slot addressing.
//!
//! A sandbox host subnet (e.g. `10.140.0.0/16`) is split in two halves:
//!
//! ```text
//! base ─┬─ lower half: veth /30 blocks, one per slot
//!       │    block = base + 4*slot   host end = block+1   ns end = block+2
//!       └─ upper half: host-cloned /32s, 254 per /24 row
//!            row = slot / 254        last octet = slot % 254 + 1
//! ```
//!
//! The two halves never overlap, /30 blocks never share an address, and
//! host-cloned addresses skip `.0` and `.255`, so every slot gets a disjoint
//! set of addresses with no network or broadcast octets.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Smallest allowed host subnet prefix.
pub const MIN_BASE_PREFIX: u8 = 8;
/// Largest allowed host subnet prefix (a /23 still holds one full /24 row).
pub const MAX_BASE_PREFIX: u8 = 23;
/// Prefix length of each veth block.
pub const VETH_PREFIX: u8 = 30;

/// Default sandbox subnet: 8192 slots.
pub const DEFAULT_SUBNET: Ipv4Cidr = Ipv4Cidr {
    network: Ipv4Addr::new(10, 140, 0, 0),
    prefix: 16,
};

const VETH_BLOCK: u32 = 4;
const HOSTS_PER_ROW: u32 = 254;
const ROW: u32 = 256;

/// An IPv4 network in CIDR notation.
///
/// The address is always normalized to the network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build a CIDR, masking off host bits.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(CoreError::Validation(format!(
                "prefix length {prefix} out of range 0..=32"
            )));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the network.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }

    /// Whether `addr` falls inside this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == u32::from(self.network)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CoreError::Validation(format!("'{s}' is not in CIDR notation")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CoreError::Validation(format!("'{addr}' is not an IPv4 address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CoreError::Validation(format!("'{prefix}' is not a prefix length")))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

/// Addresses owned by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPlan {
    /// Slot index the plan was derived from.
    pub slot: u32,
    /// Host end of the veth pair.
    pub veth_ip: Ipv4Addr,
    /// Namespace end of the veth pair.
    pub vpeer_ip: Ipv4Addr,
    /// Address the sandbox is reachable at from the host.
    pub host_cloned_ip: Ipv4Addr,
}

impl AddressPlan {
    /// The /30 holding both veth ends.
    pub fn veth_cidr(&self) -> Ipv4Cidr {
        // prefix is a constant in range
        Ipv4Cidr {
            network: Ipv4Addr::from(u32::from(self.veth_ip) & mask(VETH_PREFIX)),
            prefix: VETH_PREFIX,
        }
    }

    /// The host-cloned address as a /32.
    pub fn host_cloned_cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            network: self.host_cloned_ip,
            prefix: 32,
        }
    }
}

fn check_base(base: &Ipv4Cidr) -> Result<()> {
    if !(MIN_BASE_PREFIX..=MAX_BASE_PREFIX).contains(&base.prefix) {
        return Err(CoreError::Validation(format!(
            "sandbox subnet {base} must have a prefix between /{MIN_BASE_PREFIX} and /{MAX_BASE_PREFIX}"
        )));
    }
    Ok(())
}

/// Number of slots `base` can address.
pub fn capacity(base: &Ipv4Cidr) -> Result<u32> {
    check_base(base)?;
    // veth half is the binding constraint: (size/2)/4
    Ok((base.size() / 8) as u32)
}

/// Derive the addressing plan for `slot` inside `base`.
///
/// Fails with [`CoreError::Validation`] for a bad base subnet or a slot
/// outside `0..capacity(base)`.
pub fn plan(slot: u32, base: &Ipv4Cidr) -> Result<AddressPlan> {
    let cap = capacity(base)?;
    if slot >= cap {
        return Err(CoreError::Validation(format!(
            "slot {slot} out of range 0..{cap} for {base}"
        )));
    }

    let network = u32::from(base.network);
    let half = (base.size() / 2) as u32;

    let block = network + VETH_BLOCK * slot;
    let row = slot / HOSTS_PER_ROW;
    let host_cloned = network + half + ROW * row + slot % HOSTS_PER_ROW + 1;

    Ok(AddressPlan {
        slot,
        veth_ip: Ipv4Addr::from(block + 1),
        vpeer_ip: Ipv4Addr::from(block + 2),
        host_cloned_ip: Ipv4Addr::from(host_cloned),
    })
}
