//! NDP proxy and neighbor cache.
//!
//! A BPF-filtered packet socket delivers every Neighbor Solicitation seen on
//! the configured links. Solicitations for targets known to live on another
//! link are answered directly with a proxied Neighbor Advertisement; unknown
//! targets are probed with ICMPv6 echoes on all other links purely to kick
//! the kernels' own neighbor discovery, whose outcome comes back through the
//! netlink neighbor notifications and settles the cache.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use smoltcp::wire::{Icmpv6Message, Icmpv6Packet, IpProtocol, Ipv6Packet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::interface::Interface;
use crate::sys::netlink::{NetlinkRequest, RtEvent};
use crate::sys::procnet::prefix_contains;
use crate::sys::sockets::{
    ALL_NODES, icmp6_socket, is_link_local, ndp_packet_socket, recv_packet, send_to,
};
use crate::sys::unix_now;
use crate::wire::icmpv6::{
    NA_FLAG_ROUTER, NA_FLAG_SOLICITED, build_echo_request, build_neighbor_advert,
    parse_neighbor_solicit,
};

/// Cache ceiling; a full cache drops new probes rather than evicting.
pub const MAX_NEIGHBOR_ENTRIES: usize = 512;

/// How long an unanswered probe keeps its pending entry.
pub const PENDING_PROBE_SECS: u64 = 5;

/// Echo identifier used for neighbor probes.
const PROBE_IDENT: u16 = 0x6a6f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub target: Ipv6Addr,
    /// 128 for learned hosts, shorter for static proxied prefixes.
    pub match_len: u8,
    /// `None` while a probe is outstanding.
    pub ifindex: Option<u32>,
    pub probed_at: u64,
    pub route_installed: bool,
}

/// What to do with one Neighbor Solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsDecision {
    /// Target lives on another link: answer on its behalf.
    Advertise,
    /// Known local, or a probe is already in flight.
    Suppress,
    /// Unknown: probe the other links.
    Probe,
}

/// The bounded neighbor-location cache; pure state, no sockets.
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: Vec<NeighborEntry>,
}

impl NeighborCache {
    pub fn with_static(statics: impl IntoIterator<Item = (Ipv6Addr, u8, u32)>) -> Self {
        Self {
            entries: statics
                .into_iter()
                .map(|(target, match_len, ifindex)| NeighborEntry {
                    target,
                    match_len,
                    ifindex: Some(ifindex),
                    probed_at: 0,
                    route_installed: false,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, target: Ipv6Addr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.match_len == 128 && e.target == target)
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e.match_len < 128 && prefix_contains(e.target, e.match_len, target))
            })
    }

    pub fn get(&self, target: Ipv6Addr) -> Option<&NeighborEntry> {
        self.position(target).map(|i| &self.entries[i])
    }

    pub fn decide(&self, target: Ipv6Addr, arrival: u32, now: u64) -> NsDecision {
        match self.get(target) {
            Some(e) => match e.ifindex {
                Some(located) if located != arrival => NsDecision::Advertise,
                Some(_) => NsDecision::Suppress,
                None if now.saturating_sub(e.probed_at) < PENDING_PROBE_SECS => {
                    NsDecision::Suppress
                }
                None => NsDecision::Probe,
            },
            None => NsDecision::Probe,
        }
    }

    /// Record an outstanding probe; returns false when the cache is full.
    pub fn note_probe(&mut self, target: Ipv6Addr, now: u64) -> bool {
        if let Some(i) = self.position(target) {
            if self.entries[i].match_len == 128 && self.entries[i].ifindex.is_none() {
                self.entries[i].probed_at = now;
            }
            return true;
        }
        if self.entries.len() >= MAX_NEIGHBOR_ENTRIES {
            return false;
        }
        self.entries.push(NeighborEntry {
            target,
            match_len: 128,
            ifindex: None,
            probed_at: now,
            route_installed: false,
        });
        true
    }

    /// A kernel neighbor entry became valid on `ifindex`. Returns the
    /// interface the entry migrated away from, if any.
    pub fn resolve(&mut self, addr: Ipv6Addr, ifindex: u32, externals: &[u32]) -> Option<ResolveOutcome> {
        let i = self
            .entries
            .iter()
            .position(|e| e.match_len == 128 && e.target == addr)?;
        match self.entries[i].ifindex {
            None => {
                self.entries[i].ifindex = Some(ifindex);
                Some(ResolveOutcome::Located)
            }
            Some(old) if old == ifindex => None,
            Some(old) => {
                // Prefer non-external interfaces when the neighbor shows up
                // on both sides.
                if externals.contains(&ifindex) && !externals.contains(&old) {
                    return None;
                }
                self.entries[i].ifindex = Some(ifindex);
                Some(ResolveOutcome::Migrated { from: old })
            }
        }
    }

    /// Remove a learned entry (never a static prefix entry).
    pub fn remove(&mut self, addr: Ipv6Addr, ifindex: u32) -> Option<NeighborEntry> {
        let i = self.entries.iter().position(|e| {
            e.match_len == 128 && e.target == addr && e.ifindex == Some(ifindex)
        })?;
        Some(self.entries.remove(i))
    }

    pub fn mark_route(&mut self, addr: Ipv6Addr, installed: bool) {
        if let Some(i) = self.entries.iter().position(|e| e.match_len == 128 && e.target == addr) {
            self.entries[i].route_installed = installed;
        }
    }

    /// Drop pending entries whose probe went unanswered.
    pub fn evict_stale(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.match_len < 128
                || e.ifindex.is_some()
                || now.saturating_sub(e.probed_at) < PENDING_PROBE_SECS
        });
        before - self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Located,
    Migrated { from: u32 },
}

pub struct NdpProxy {
    pkt_sock: OwnedFd,
    /// Send-only raw socket for proxied NAs and echo probes.
    icmp_sock: OwnedFd,
    cache: NeighborCache,
    echo_seq: u16,
}

impl NdpProxy {
    pub fn init(cfg: &Config, ifaces: &[Interface]) -> std::io::Result<Self> {
        let pkt_sock = ndp_packet_socket()?;
        let icmp_sock = icmp6_socket(&[])?;
        let statics = cfg.static_ndp.iter().filter_map(|s| {
            let iface = ifaces.iter().find(|i| i.name == s.ifname)?;
            Some((s.prefix.network(), s.prefix.prefix_len(), iface.ifindex))
        });
        Ok(Self { pkt_sock, icmp_sock, cache: NeighborCache::with_static(statics), echo_seq: 0 })
    }

    pub fn pkt_fd(&self) -> BorrowedFd<'_> {
        self.pkt_sock.as_fd()
    }

    /// Drain and handle filtered Neighbor Solicitations.
    pub fn handle_packet_socket(&mut self, ifaces: &[Interface]) {
        let mut buf = [0u8; 1500];
        loop {
            let (len, arrival) = match recv_packet(&self.pkt_sock, &mut buf) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "ndp packet recv failed");
                    continue;
                }
            };
            let Some(iface) = ifaces.iter().find(|i| i.ifindex == arrival) else {
                continue;
            };
            let Ok(ip) = Ipv6Packet::new_checked(&buf[..len]) else {
                continue;
            };
            if ip.next_header() != IpProtocol::Icmpv6 {
                continue;
            }
            let Ok(icmp) = Icmpv6Packet::new_checked(ip.payload()) else {
                continue;
            };
            if icmp.msg_type() != Icmpv6Message::NeighborSolicit {
                continue;
            }
            let Some(target) = parse_neighbor_solicit(ip.payload()) else {
                continue;
            };
            let src: Ipv6Addr = ip.src_addr();
            let dad = src.is_unspecified();
            // External links only take part in DAD and router traffic.
            if iface.external && !dad {
                continue;
            }
            if target.is_unspecified()
                || target.is_loopback()
                || target.is_multicast()
                || is_link_local(target)
            {
                continue;
            }
            self.handle_solicit(ifaces, iface, target, src, dad);
        }
    }

    fn handle_solicit(
        &mut self,
        ifaces: &[Interface],
        arrival: &Interface,
        target: Ipv6Addr,
        src: Ipv6Addr,
        dad: bool,
    ) {
        let now = unix_now();
        match self.cache.decide(target, arrival.ifindex, now) {
            NsDecision::Advertise => {
                let na = build_neighbor_advert(
                    target,
                    NA_FLAG_ROUTER | NA_FLAG_SOLICITED,
                    arrival.mac,
                );
                let dst = if dad {
                    SocketAddrV6::new(ALL_NODES, 0, 0, arrival.ifindex)
                } else {
                    SocketAddrV6::new(src, 0, 0, arrival.ifindex)
                };
                send_to(&self.icmp_sock, &na, dst, arrival.ifindex);
                debug!(%target, ifname = %arrival.name, dad, "proxied neighbor advertisement");
            }
            NsDecision::Suppress => {}
            NsDecision::Probe => {
                if !self.cache.note_probe(target, now) {
                    debug!(%target, "neighbor cache full, probe dropped");
                    return;
                }
                self.echo_seq = self.echo_seq.wrapping_add(1);
                let echo = build_echo_request(PROBE_IDENT, self.echo_seq);
                for iface in ifaces {
                    if iface.ifindex == arrival.ifindex || (dad && iface.external) {
                        continue;
                    }
                    send_to(
                        &self.icmp_sock,
                        &echo,
                        SocketAddrV6::new(target, 0, 0, 0),
                        iface.ifindex,
                    );
                }
                debug!(%target, from = %arrival.name, "probing for neighbor");
            }
        }
    }

    /// Feed a netlink neighbor notification into the cache and mirror the
    /// outcome into the kernel routing table.
    pub fn handle_neigh_event(
        &mut self,
        cfg: &Config,
        ifaces: &[Interface],
        nl: &mut NetlinkRequest,
        event: RtEvent,
    ) {
        let externals: Vec<u32> =
            ifaces.iter().filter(|i| i.external).map(|i| i.ifindex).collect();
        match event {
            RtEvent::NewNeigh { ifindex, addr, state } => {
                if !ifaces.iter().any(|i| i.ifindex == ifindex) {
                    return;
                }
                if state & crate::sys::netlink::NUD_VALID == 0 {
                    // FAILED/INCOMPLETE: treat like a removal.
                    self.forget(cfg, nl, addr, ifindex);
                    return;
                }
                match self.cache.resolve(addr, ifindex, &externals) {
                    Some(ResolveOutcome::Located) => {
                        info!(%addr, ifindex, "neighbor located");
                        self.install_route(cfg, nl, addr, ifindex);
                    }
                    Some(ResolveOutcome::Migrated { from }) => {
                        info!(%addr, from, to = ifindex, "neighbor migrated");
                        if cfg.learn_routes {
                            if let Err(e) = nl.set_route(addr, 128, from, None, false) {
                                debug!(%addr, error = %e, "stale route removal failed");
                            }
                        }
                        self.install_route(cfg, nl, addr, ifindex);
                    }
                    None => {}
                }
            }
            RtEvent::DelNeigh { ifindex, addr } => {
                self.forget(cfg, nl, addr, ifindex);
            }
            _ => {}
        }
    }

    fn install_route(&mut self, cfg: &Config, nl: &mut NetlinkRequest, addr: Ipv6Addr, ifindex: u32) {
        if !cfg.learn_routes {
            return;
        }
        match nl.set_route(addr, 128, ifindex, None, true) {
            Ok(()) => self.cache.mark_route(addr, true),
            Err(e) => warn!(%addr, ifindex, error = %e, "host route install failed"),
        }
    }

    fn forget(&mut self, cfg: &Config, nl: &mut NetlinkRequest, addr: Ipv6Addr, ifindex: u32) {
        if let Some(entry) = self.cache.remove(addr, ifindex) {
            debug!(%addr, ifindex, "neighbor forgotten");
            if cfg.learn_routes
                && entry.route_installed
                && let Err(e) = nl.set_route(addr, 128, ifindex, None, false)
            {
                debug!(%addr, error = %e, "learned route removal failed");
            }
        }
    }

    /// Periodic upkeep from the sweep timer.
    pub fn sweep(&mut self, now: u64) {
        let evicted = self.cache.evict_stale(now);
        if evicted > 0 {
            debug!(evicted, "evicted unanswered neighbor probes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x500);
    const SLAVE_A: u32 = 3;
    const SLAVE_B: u32 = 4;

    #[test]
    fn test_located_on_other_interface_advertises_without_reprobe() {
        let mut cache = NeighborCache::default();
        assert!(cache.note_probe(TARGET, 100));
        assert_eq!(cache.resolve(TARGET, SLAVE_B, &[]), Some(ResolveOutcome::Located));

        // NS for the target arriving on A, target lives on B.
        assert_eq!(cache.decide(TARGET, SLAVE_A, 101), NsDecision::Advertise);
        // On B itself the kernel answers; we stay silent.
        assert_eq!(cache.decide(TARGET, SLAVE_B, 101), NsDecision::Suppress);
    }

    #[test]
    fn test_fresh_pending_probe_suppresses() {
        let mut cache = NeighborCache::default();
        assert!(cache.note_probe(TARGET, 100));
        assert_eq!(cache.decide(TARGET, SLAVE_A, 103), NsDecision::Suppress);
        // After the window it is probed again.
        assert_eq!(cache.decide(TARGET, SLAVE_A, 106), NsDecision::Probe);
    }

    #[test]
    fn test_migration_prefers_internal_interface() {
        let mut cache = NeighborCache::default();
        cache.note_probe(TARGET, 100);
        cache.resolve(TARGET, SLAVE_A, &[SLAVE_B]);

        // Showing up on the external side does not move it.
        assert_eq!(cache.resolve(TARGET, SLAVE_B, &[SLAVE_B]), None);
        assert_eq!(cache.get(TARGET).unwrap().ifindex, Some(SLAVE_A));

        // Showing up on another internal side does.
        assert_eq!(
            cache.resolve(TARGET, 5, &[SLAVE_B]),
            Some(ResolveOutcome::Migrated { from: SLAVE_A })
        );
    }

    #[test]
    fn test_static_prefix_entries_never_expire() {
        let prefix: Ipv6Addr = "2001:db8:1::".parse().unwrap();
        let mut cache = NeighborCache::with_static([(prefix, 64, SLAVE_B)]);

        let inside: Ipv6Addr = "2001:db8:1::77".parse().unwrap();
        assert_eq!(cache.decide(inside, SLAVE_A, 100), NsDecision::Advertise);
        assert_eq!(cache.evict_stale(1_000_000), 0);
        assert_eq!(cache.len(), 1);
        // Static entries are not removable either.
        assert!(cache.remove(inside, SLAVE_B).is_none());
    }

    #[test]
    fn test_cache_bounded() {
        let mut cache = NeighborCache::default();
        for i in 0..MAX_NEIGHBOR_ENTRIES as u32 {
            let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, (i >> 16) as u16, i as u16);
            assert!(cache.note_probe(addr, 100));
        }
        assert!(!cache.note_probe("2001:db8:ffff::1".parse().unwrap(), 100));
        assert_eq!(cache.len(), MAX_NEIGHBOR_ENTRIES);

        // Stale probes age out and make room again.
        assert_eq!(cache.evict_stale(100 + PENDING_PROBE_SECS), MAX_NEIGHBOR_ENTRIES);
        assert!(cache.note_probe("2001:db8:ffff::1".parse().unwrap(), 200));
    }

    #[test]
    fn test_remove_requires_matching_interface() {
        let mut cache = NeighborCache::default();
        cache.note_probe(TARGET, 100);
        cache.resolve(TARGET, SLAVE_A, &[]);
        assert!(cache.remove(TARGET, SLAVE_B).is_none());
        assert!(cache.remove(TARGET, SLAVE_A).is_some());
        assert!(cache.is_empty());
    }
}
