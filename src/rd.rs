//! Router Discovery engine.
//!
//! Relay mode forwards the master's Router Advertisements onto every slave
//! (source link-layer option rewritten, advertisement marked proxied) and
//! slave Router Solicitations up to the master. Server mode synthesizes
//! advertisements from the interface's own address/route state on a jittered
//! per-slave timer.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use crate::interface::{Interface, truncate};
use crate::sys::netlink::NetlinkRequest;
use crate::sys::procnet::{self, RouteTable};
use crate::sys::sockets::{
    ALL_NODES, ALL_ROUTERS, icmp6_socket, is_global_unicast, is_ula, join_multicast, recv_from,
    send_to,
};
use crate::sys::unix_now;
use crate::wire::icmpv6::{
    ND_ROUTER_ADVERT, ND_ROUTER_SOLICIT, RaPrefix, RaRoute, RouterAdvert, build_router_solicit,
    rewrite_router_advert,
};

/// RFC 4861 default advertisement interval bounds.
const MIN_RTR_ADV_INTERVAL: u64 = 200;
const MAX_RTR_ADV_INTERVAL: u64 = 600;

/// AdvDefaultLifetime: 3 × MaxRtrAdvInterval.
const DEFAULT_ROUTER_LIFETIME: u16 = 1800;

/// Protocol cap on advertised lifetimes.
const MAX_ADV_LIFETIME: u32 = 86400;

pub struct RouterDisc {
    sock: OwnedFd,
    /// One resend timer per slave.
    timers: Vec<TimerFd>,
    mode: Mode,
}

impl RouterDisc {
    pub fn init(cfg: &Config, ifaces: &[Interface]) -> std::io::Result<Self> {
        let sock = icmp6_socket(&[ND_ROUTER_SOLICIT, ND_ROUTER_ADVERT])?;
        let mut timers = Vec::new();
        for iface in &ifaces[1..] {
            join_multicast(&sock, ALL_ROUTERS, iface.ifindex)?;
            let timer =
                TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC)
                    .map_err(std::io::Error::from)?;
            timers.push(timer);
        }
        let rd = Self { sock, timers, mode: cfg.router_discovery };
        if rd.mode == Mode::Server {
            for i in 0..rd.timers.len() {
                // First advertisement goes out promptly, then jittered.
                rd.schedule(i, 1);
            }
        }
        if cfg.send_rs {
            let rs = build_router_solicit(ifaces[0].mac);
            send_to(&rd.sock, &rs, SocketAddrV6::new(ALL_ROUTERS, 0, 0, 0), ifaces[0].ifindex);
            info!(ifname = %ifaces[0].name, "sent startup router solicitation");
        }
        Ok(rd)
    }

    pub fn sock_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    pub fn timer_fd(&self, slave: usize) -> BorrowedFd<'_> {
        self.timers[slave].as_fd()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Arm a slave's resend timer.
    pub fn schedule(&self, slave: usize, secs: u64) {
        if let Err(e) = self.timers[slave]
            .set(Expiration::OneShot(TimeSpec::new(secs as i64, 0)), TimerSetTimeFlags::empty())
        {
            warn!(slave, error = %e, "failed to arm RA timer");
        }
    }

    /// Request an immediate (1s) advertisement refresh on all slaves.
    pub fn refresh_all(&self) {
        if self.mode == Mode::Server {
            for i in 0..self.timers.len() {
                self.schedule(i, 1);
            }
        }
    }

    /// Same, for the slaves whose address table changed.
    pub fn refresh_slave(&self, slave: usize) {
        if self.mode == Mode::Server {
            self.schedule(slave, 1);
        }
    }

    /// Drain the ICMPv6 socket and handle RS/RA traffic.
    pub fn handle_socket(&mut self, cfg: &Config, ifaces: &mut [Interface]) {
        let mut buf = [0u8; 1500];
        loop {
            let dgram = match recv_from(&self.sock, &mut buf) {
                Ok(Some(d)) => d,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "router discovery recv failed");
                    continue;
                }
            };
            if dgram.len < 8 {
                continue;
            }
            let payload = &buf[..dgram.len];
            match payload[0] {
                ND_ROUTER_ADVERT
                    if dgram.ifindex == ifaces[0].ifindex && self.mode == Mode::Relay =>
                {
                    self.relay_advert(cfg, ifaces, payload, unix_now());
                }
                ND_ROUTER_SOLICIT => {
                    let Some(slave) =
                        ifaces[1..].iter().position(|i| i.ifindex == dgram.ifindex)
                    else {
                        continue;
                    };
                    match self.mode {
                        Mode::Relay => {
                            let rs = build_router_solicit(ifaces[0].mac);
                            send_to(
                                &self.sock,
                                &rs,
                                SocketAddrV6::new(ALL_ROUTERS, 0, 0, 0),
                                ifaces[0].ifindex,
                            );
                            debug!(from = %ifaces[slave + 1].name, "relayed router solicitation");
                        }
                        Mode::Server => self.schedule(slave, 1),
                        Mode::Disabled => {}
                    }
                }
                _ => {}
            }
        }
    }

    fn relay_advert(&self, cfg: &Config, ifaces: &[Interface], payload: &[u8], now: u64) {
        for iface in &ifaces[1..] {
            let dns = if cfg.rewrite_dns {
                cfg.dns_server.or_else(|| iface.dns_source(now))
            } else {
                None
            };
            let Some(out) = rewrite_router_advert(payload, iface.mac, dns) else {
                debug!("dropping malformed router advertisement");
                return;
            };
            send_to(&self.sock, &out, SocketAddrV6::new(ALL_NODES, 0, 0, 0), iface.ifindex);
        }
        debug!(slaves = ifaces.len() - 1, "relayed router advertisement");
    }

    /// Timer fired for one slave: refresh state, advertise, re-arm.
    pub fn handle_timer(
        &mut self,
        slave: usize,
        cfg: &Config,
        ifaces: &mut [Interface],
        nl: &mut NetlinkRequest,
    ) {
        crate::dispatch::drain_timer(&self.timers[slave]);
        if self.mode != Mode::Server {
            return;
        }
        let now = unix_now();
        ifaces[slave + 1].refresh_addresses(nl, now);
        let rt = RouteTable::load().unwrap_or_default();
        self.send_advert(cfg, &ifaces[slave + 1], &rt, now, false);

        let interval = rand::rng().random_range(MIN_RTR_ADV_INTERVAL..=MAX_RTR_ADV_INTERVAL);
        self.schedule(slave, interval);
    }

    fn send_advert(&self, cfg: &Config, iface: &Interface, rt: &RouteTable, now: u64, withdraw: bool) {
        let mtu = procnet::interface_mtu(&iface.name).ok();
        let search = cfg.search_domain.clone().or_else(procnet::resolv_search_domain);
        let ra = build_router_advert(cfg, iface, rt, mtu, search.as_deref(), now, withdraw);
        send_to(&self.sock, &ra.build(), SocketAddrV6::new(ALL_NODES, 0, 0, 0), iface.ifindex);
        debug!(
            ifname = %iface.name,
            prefixes = ra.prefixes.len(),
            lifetime = ra.router_lifetime,
            "sent router advertisement"
        );
    }

    /// Final zero-lifetime advertisements on shutdown.
    pub fn shutdown(&mut self, cfg: &Config, ifaces: &mut [Interface], nl: &mut NetlinkRequest) {
        if self.mode != Mode::Server {
            return;
        }
        let now = unix_now();
        let rt = RouteTable::load().unwrap_or_default();
        for iface in ifaces[1..].iter_mut() {
            iface.refresh_addresses(nl, now);
            self.send_advert(cfg, iface, &rt, now, true);
        }
    }
}

/// Assemble one Router Advertisement from an address/route snapshot. Pure
/// over its inputs: an unchanged snapshot yields identical bytes.
pub fn build_router_advert(
    cfg: &Config,
    iface: &Interface,
    rt: &RouteTable,
    mtu: Option<u32>,
    search: Option<&str>,
    now: u64,
    withdraw: bool,
) -> RouterAdvert {
    // One prefix option per distinct /64, longest lifetimes winning.
    let mut prefixes: Vec<(Ipv6Addr, u32, u32, bool)> = Vec::new();
    for a in &iface.addrs {
        if a.prefix_len > 64 || a.valid_until <= now {
            continue;
        }
        let p64 = truncate(a.addr, 64);
        let preferred = a.preferred_remaining(now).min(MAX_ADV_LIFETIME);
        let valid = a.valid_remaining(now).min(MAX_ADV_LIFETIME);
        if let Some(e) = prefixes.iter_mut().find(|(p, ..)| *p == p64) {
            e.1 = e.1.max(preferred);
            e.2 = e.2.max(valid);
        } else {
            prefixes.push((p64, preferred, valid, is_ula(a.addr)));
        }
    }
    let have_public = prefixes.iter().any(|(_, _, _, ula)| !ula);

    let router_lifetime = if withdraw {
        0
    } else if rt.have_default && (have_public || cfg.always_default_router) {
        DEFAULT_ROUTER_LIFETIME
    } else {
        if rt.have_default && !have_public {
            warn!(
                ifname = %iface.name,
                "default route present but no public prefix; not announcing default router"
            );
        }
        0
    };

    let mut ra = RouterAdvert {
        hop_limit: 64,
        managed: cfg.dhcpv6.enabled(),
        other: cfg.dhcpv6.enabled(),
        preference: cfg.preference,
        router_lifetime,
        source_lladdr: iface.mac,
        mtu: mtu.filter(|m| *m >= 1280),
        dns_lifetime: MAX_ADV_LIFETIME,
        search_domain: search.map(str::to_string),
        ..Default::default()
    };

    for (prefix, preferred, valid, ula) in &prefixes {
        let preferred =
            if *ula && cfg.deprecate_ula && have_public { 0 } else { *preferred };
        ra.prefixes.push(RaPrefix {
            prefix: *prefix,
            prefix_len: 64,
            onlink: true,
            autonomous: true,
            preferred,
            valid: *valid,
        });
        ra.routes.push(RaRoute {
            prefix: *prefix,
            prefix_len: 64,
            lifetime: *valid,
            preference: cfg.preference,
        });
    }

    let dns = cfg.dns_server.or_else(|| {
        iface
            .addrs
            .iter()
            .find(|a| a.valid_until > now && is_global_unicast(a.addr))
            .map(|a| a.addr)
    });
    if let Some(dns) = dns {
        ra.dns_servers.push(dns);
        ra.dns_lifetime = prefixes
            .iter()
            .filter(|(_, _, _, ula)| !ula)
            .map(|(_, _, v, _)| *v)
            .max()
            .unwrap_or(MAX_ADV_LIFETIME);
    }
    ra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::AddrEntry;
    use crate::wire::icmpv6::RouterPreference;

    fn test_config() -> Config {
        Config {
            master: "wan0".into(),
            slaves: vec!["lan0".into()],
            external: vec![],
            router_discovery: Mode::Server,
            dhcpv6: Mode::Server,
            ndp_proxy: false,
            learn_routes: false,
            send_rs: false,
            rewrite_dns: false,
            deprecate_ula: true,
            always_default_router: false,
            preference: RouterPreference::Medium,
            server_preference: 0,
            dns_server: None,
            search_domain: None,
            static_ndp: vec![],
            lease_file: None,
            lease_callback: None,
        }
    }

    fn test_iface(addrs: Vec<AddrEntry>) -> Interface {
        Interface {
            ifindex: 3,
            name: "lan0".into(),
            mac: [2, 0, 0, 0, 0, 3],
            external: false,
            addrs,
        }
    }

    fn addr(s: &str, preferred_until: u64, valid_until: u64) -> AddrEntry {
        AddrEntry { addr: s.parse().unwrap(), prefix_len: 64, preferred_until, valid_until }
    }

    #[test]
    fn test_ula_deprecated_when_public_present() {
        let now = 1000;
        let iface = test_iface(vec![
            addr("2001:db8::1", now + 3600, now + 3600),
            addr("fc00::1", now + 3600, now + 3600),
        ]);
        let rt = RouteTable { have_default: true, reject: vec![] };
        let ra = build_router_advert(&test_config(), &iface, &rt, Some(1500), None, now, false);

        let global = ra
            .prefixes
            .iter()
            .find(|p| p.prefix == "2001:db8::".parse::<Ipv6Addr>().unwrap())
            .unwrap();
        let ula =
            ra.prefixes.iter().find(|p| p.prefix == "fc00::".parse::<Ipv6Addr>().unwrap()).unwrap();
        assert_eq!(ula.preferred, 0);
        assert_eq!(global.preferred, 3600);
        assert!(global.valid <= 86400);
        assert_eq!(ra.router_lifetime, DEFAULT_ROUTER_LIFETIME);
    }

    #[test]
    fn test_ra_idempotent_for_unchanged_snapshot() {
        let now = 1000;
        let iface = test_iface(vec![
            addr("2001:db8::1", now + 3600, now + 7200),
            addr("2001:db8:0:1::1", now + 600, now + 600),
        ]);
        let rt = RouteTable { have_default: true, reject: vec![] };
        let cfg = test_config();
        let a = build_router_advert(&cfg, &iface, &rt, Some(1500), Some("lan"), now, false);
        let b = build_router_advert(&cfg, &iface, &rt, Some(1500), Some("lan"), now, false);
        assert_eq!(a.build(), b.build());
    }

    #[test]
    fn test_no_default_router_without_public_prefix() {
        let now = 1000;
        let iface = test_iface(vec![addr("fc00::1", now + 3600, now + 3600)]);
        let rt = RouteTable { have_default: true, reject: vec![] };
        let ra = build_router_advert(&test_config(), &iface, &rt, None, None, now, false);
        assert_eq!(ra.router_lifetime, 0);
        // ULA stays preferred when it is the only prefix.
        assert_eq!(ra.prefixes[0].preferred, 3600);

        let mut cfg = test_config();
        cfg.always_default_router = true;
        let ra = build_router_advert(&cfg, &iface, &rt, None, None, now, false);
        assert_eq!(ra.router_lifetime, DEFAULT_ROUTER_LIFETIME);
    }

    #[test]
    fn test_lifetimes_clamped() {
        let now = 1000;
        let iface = test_iface(vec![addr("2001:db8::1", now + 1_000_000, now + 2_000_000)]);
        let rt = RouteTable::default();
        let ra = build_router_advert(&test_config(), &iface, &rt, None, None, now, false);
        assert_eq!(ra.prefixes[0].preferred, 86400);
        assert_eq!(ra.prefixes[0].valid, 86400);
        // No default route: no default router either.
        assert_eq!(ra.router_lifetime, 0);
    }

    #[test]
    fn test_final_ra_withdraws_router() {
        let now = 1000;
        let iface = test_iface(vec![addr("2001:db8::1", now + 3600, now + 3600)]);
        let rt = RouteTable { have_default: true, reject: vec![] };
        let ra = build_router_advert(&test_config(), &iface, &rt, None, None, now, true);
        assert_eq!(ra.router_lifetime, 0);
    }

    #[test]
    fn test_dedup_per_64() {
        let now = 1000;
        let iface = test_iface(vec![
            addr("2001:db8::1", now + 600, now + 600),
            addr("2001:db8::2", now + 3600, now + 7200),
        ]);
        let rt = RouteTable::default();
        let ra = build_router_advert(&test_config(), &iface, &rt, None, None, now, false);
        assert_eq!(ra.prefixes.len(), 1);
        assert_eq!(ra.prefixes[0].preferred, 3600);
        assert_eq!(ra.prefixes[0].valid, 7200);
    }
}
