//! Interface registry: master/slave roles and the cached address table.

use std::io;
use std::net::Ipv6Addr;

use tracing::debug;

use crate::sys::netlink::NetlinkRequest;
use crate::sys::procnet::{self, RouteTable};
use crate::sys::sockets::{is_global_unicast, is_ula};

/// Address-cache ceiling per interface; extra kernel records are discarded.
pub const MAX_ADDRS: usize = 8;

/// A cached global address with absolute lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub preferred_until: u64,
    pub valid_until: u64,
}

impl AddrEntry {
    pub fn preferred_remaining(&self, now: u64) -> u32 {
        self.preferred_until.saturating_sub(now).min(u32::MAX as u64) as u32
    }

    pub fn valid_remaining(&self, now: u64) -> u32 {
        self.valid_until.saturating_sub(now).min(u32::MAX as u64) as u32
    }

    /// Sort key: globally routable prefixes first, ULA pinned to an
    /// effective preference of 1 so they always sort behind.
    fn effective_preference(&self, now: u64) -> u64 {
        if is_ula(self.addr) { 1 } else { u64::from(self.preferred_remaining(now)) }
    }
}

/// One configured interface (index 0 of the registry is the master).
#[derive(Debug)]
pub struct Interface {
    pub ifindex: u32,
    pub name: String,
    pub mac: [u8; 6],
    /// Only DAD and router traffic is proxied onto external links.
    pub external: bool,
    pub addrs: Vec<AddrEntry>,
}

impl Interface {
    pub fn from_system(name: &str, external: bool) -> io::Result<Self> {
        Ok(Self {
            ifindex: procnet::interface_index(name)?,
            name: name.to_string(),
            mac: procnet::interface_mac(name)?,
            external,
            addrs: Vec::new(),
        })
    }

    /// Re-query the kernel's address table for this interface.
    pub fn refresh_addresses(&mut self, nl: &mut NetlinkRequest, now: u64) {
        match nl.dump_addresses(self.ifindex, MAX_ADDRS) {
            Ok(infos) => {
                self.addrs = infos
                    .into_iter()
                    .map(|i| AddrEntry {
                        addr: i.addr,
                        prefix_len: i.prefix_len,
                        preferred_until: now.saturating_add(u64::from(i.preferred)),
                        valid_until: now.saturating_add(u64::from(i.valid)),
                    })
                    .collect();
                self.addrs.sort_by(|a, b| {
                    b.effective_preference(now).cmp(&a.effective_preference(now))
                });
            }
            Err(e) => {
                debug!(ifname = %self.name, error = %e, "address dump failed");
            }
        }
    }

    /// Most-preferred global address (non-ULA first).
    pub fn best_source(&self, now: u64) -> Option<Ipv6Addr> {
        self.addrs
            .iter()
            .find(|a| a.valid_until > now && is_global_unicast(a.addr))
            .or_else(|| self.addrs.iter().find(|a| a.valid_until > now))
            .map(|a| a.addr)
    }

    /// Most-preferred non-ULA address, for RDNSS and DNS rewriting.
    pub fn dns_source(&self, now: u64) -> Option<Ipv6Addr> {
        self.best_source(now)
    }
}

/// A prefix the interface may advertise and delegate from, with its
/// length refined by the kernel's unreachable-route aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlinkPrefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub preferred_until: u64,
    pub valid_until: u64,
    pub ula: bool,
}

impl OnlinkPrefix {
    pub fn preferred_remaining(&self, now: u64) -> u32 {
        self.preferred_until.saturating_sub(now).min(u32::MAX as u64) as u32
    }

    pub fn valid_remaining(&self, now: u64) -> u32 {
        self.valid_until.saturating_sub(now).min(u32::MAX as u64) as u32
    }
}

/// Derive the deduplicated on-link prefix set from the address cache.
pub fn onlink_prefixes(iface: &Interface, rt: &RouteTable) -> Vec<OnlinkPrefix> {
    let mut out: Vec<OnlinkPrefix> = Vec::new();
    for a in &iface.addrs {
        if a.prefix_len > 64 {
            continue;
        }
        let len = rt.refine_prefix_len(a.addr, a.prefix_len);
        let prefix = truncate(a.addr, len);
        if let Some(existing) = out.iter_mut().find(|p| p.prefix == prefix && p.prefix_len == len) {
            existing.preferred_until = existing.preferred_until.max(a.preferred_until);
            existing.valid_until = existing.valid_until.max(a.valid_until);
        } else {
            out.push(OnlinkPrefix {
                prefix,
                prefix_len: len,
                preferred_until: a.preferred_until,
                valid_until: a.valid_until,
                ula: is_ula(a.addr),
            });
        }
    }
    out
}

/// Zero the host bits of an address.
pub fn truncate(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let len = u32::from(prefix_len.min(128));
    if len == 0 {
        return Ipv6Addr::UNSPECIFIED;
    }
    let mask = u128::MAX << (128 - len);
    Ipv6Addr::from(u128::from_be_bytes(addr.octets()) & mask)
}

/// The delegated prefix for a binding: the on-link base advanced by
/// `assigned` /64 blocks.
pub fn delegated_prefix(base: Ipv6Addr, assigned: u64) -> Ipv6Addr {
    let hi = (u128::from_be_bytes(base.octets()) >> 64) as u64;
    let hi = hi.wrapping_add(assigned);
    Ipv6Addr::from((u128::from(hi)) << 64)
}

/// The IA_NA address for a binding: the /64 with `assigned` as the low
/// interface-identifier bits.
pub fn na_address(prefix64: Ipv6Addr, assigned: u64) -> Ipv6Addr {
    let hi = u128::from_be_bytes(truncate(prefix64, 64).octets());
    Ipv6Addr::from(hi | u128::from(assigned))
}

/// The low interface-identifier bits of an address (IA_NA suffix space).
pub fn na_suffix(addr: Ipv6Addr) -> u64 {
    u128::from_be_bytes(addr.octets()) as u64
}
