//! DHCPv6 relay and built-in stateful server.
//!
//! Relay mode wraps slave-side client traffic into RELAY-FORW envelopes
//! toward the real servers on the master link and unwraps RELAY-REPL on the
//! way back. Server mode answers IA_NA/IA_PD requests from the per-slave
//! binding sets in [`crate::ia`], persists committed state to the lease
//! file, and drives the reconfigure sub-protocol from the 2-second sweep.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use crate::ia::{
    Binding, BindingSet, DECLINE_RESERVE_SECS, LeaseRecord, LeaseStore, MAX_DUID_LEN,
    RECONF_MAX_ATTEMPTS,
};
use crate::interface::{Interface, OnlinkPrefix, delegated_prefix, na_address, na_suffix, onlink_prefixes};
use crate::sys::netlink::NetlinkRequest;
use crate::sys::procnet::{RouteTable, prefix_contains};
use crate::sys::sockets::{
    ALL_DHCPV6_RELAYS_AND_SERVERS, DHCPV6_CLIENT_PORT, DHCPV6_SERVER_PORT, dhcpv6_socket,
    join_multicast, recv_from, send_to,
};
use crate::sys::unix_now;
use crate::wire::dhcpv6::*;
use crate::wire::icmpv6::first_dns_label;

/// Relay chains deeper than this are dropped.
pub const MAX_HOP_COUNT: u8 = 32;

/// Advertised lifetime ceiling, matching the Router Discovery engine.
const MAX_LEASE_LIFETIME: u32 = 86400;

/// SOL_MAX_RT / INF_MAX_RT handed to clients that ask.
const MAX_RT_SECS: u32 = 3600;

type HmacMd5 = Hmac<Md5>;

/// Everything the pure message handler needs besides the binding set.
pub struct ServerContext<'a> {
    pub cfg: &'a Config,
    pub server_duid: &'a [u8],
    pub prefixes: &'a [OnlinkPrefix],
    pub now: u64,
    /// DNS server handed to clients (configured override or the
    /// interface's own best non-ULA address).
    pub dns: Option<Ipv6Addr>,
    /// Key material for a binding that newly negotiates reconfigure.
    pub fresh_key: [u8; 16],
}

impl ServerContext<'_> {
    fn have_public(&self) -> bool {
        self.prefixes.iter().any(|p| !p.ula)
    }

    /// Preferred lifetime of a prefix after the ULA suppression workaround.
    fn effective_preferred(&self, p: &OnlinkPrefix) -> u32 {
        if p.ula && self.cfg.deprecate_ula && self.have_public() {
            0
        } else {
            p.preferred_remaining(self.now).min(MAX_LEASE_LIFETIME)
        }
    }

    fn border(&self) -> u64 {
        self.prefixes
            .iter()
            .filter(|p| p.prefix_len <= 64)
            .map(|p| 1u64 << (64 - p.prefix_len))
            .min()
            .unwrap_or(0)
    }
}

/// Kernel route change requested by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add { prefix: Ipv6Addr, prefix_len: u8, gateway: Ipv6Addr },
    Del { prefix: Ipv6Addr, prefix_len: u8, gateway: Ipv6Addr },
}

/// The result of handling one server-mode message.
#[derive(Debug, Default)]
pub struct ServerAction {
    pub reply: Vec<u8>,
    pub routes: Vec<RouteOp>,
    pub persist: bool,
}

enum IaOutcome {
    Bound(usize),
    Fail(u16),
}

pub struct Dhcpv6 {
    sock: OwnedFd,
    mode: Mode,
    server_duid: Vec<u8>,
    /// One binding set per slave, parallel to the slave list.
    bindings: Vec<BindingSet>,
    lease_store: Option<LeaseStore>,
    /// Raised by master address changes, consumed by the sweep.
    needs_reconf: bool,
    reconf_replay: u64,
}

impl Dhcpv6 {
    pub fn init(cfg: &Config, ifaces: &[Interface]) -> std::io::Result<Self> {
        let sock = dhcpv6_socket()?;
        for iface in &ifaces[1..] {
            join_multicast(&sock, ALL_DHCPV6_RELAYS_AND_SERVERS, iface.ifindex)?;
        }
        // DUID-LL derived from the master's address, stable across restarts.
        let mut server_duid = vec![0, 3, 0, 1];
        server_duid.extend_from_slice(&ifaces[0].mac);
        Ok(Self {
            sock,
            mode: cfg.dhcpv6,
            server_duid,
            bindings: (1..ifaces.len()).map(|_| BindingSet::new()).collect(),
            lease_store: cfg
                .lease_file
                .clone()
                .map(|p| LeaseStore::new(p, cfg.lease_callback.clone())),
            needs_reconf: false,
            reconf_replay: 0,
        })
    }

    pub fn sock_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Called when the master's address table changed; the next sweep
    /// checks which bindings fell out of range.
    pub fn mark_needs_reconf(&mut self) {
        self.needs_reconf = true;
    }

    pub fn handle_socket(&mut self, cfg: &Config, ifaces: &mut [Interface], nl: &mut NetlinkRequest) {
        let mut buf = [0u8; 4096];
        loop {
            let dgram = match recv_from(&self.sock, &mut buf) {
                Ok(Some(d)) => d,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "dhcpv6 recv failed");
                    continue;
                }
            };
            let payload = buf[..dgram.len].to_vec();
            let Some(packet) = parse(&payload) else {
                debug!(len = dgram.len, "dropping malformed dhcpv6 packet");
                continue;
            };
            if dgram.ifindex == ifaces[0].ifindex {
                if self.mode == Mode::Relay
                    && let Packet::Relay(relay) = packet
                {
                    self.relay_reply(cfg, ifaces, &relay, unix_now());
                }
                continue;
            }
            let Some(slave) = ifaces[1..].iter().position(|i| i.ifindex == dgram.ifindex) else {
                continue;
            };
            match self.mode {
                Mode::Relay => {
                    self.relay_forward(ifaces, slave, &payload, &packet, dgram.src, unix_now());
                }
                Mode::Server => {
                    if let Packet::Message(msg) = packet {
                        self.server_receive(cfg, ifaces, nl, slave, &msg, dgram.src);
                    }
                }
                Mode::Disabled => {}
            }
        }
    }

    /// Client → servers: wrap and multicast out the master.
    fn relay_forward(
        &self,
        ifaces: &[Interface],
        slave: usize,
        payload: &[u8],
        packet: &Packet<'_>,
        src: SocketAddrV6,
        now: u64,
    ) {
        let hop_count = match packet {
            Packet::Relay(r) if r.msg_type == MSG_RELAY_FORW => {
                if r.hop_count >= MAX_HOP_COUNT {
                    debug!(hops = r.hop_count, "relay chain too deep, dropping");
                    return;
                }
                r.hop_count + 1
            }
            Packet::Relay(_) => return,
            Packet::Message(_) => 0,
        };
        let iface = &ifaces[slave + 1];
        // The link address names the link the client sits on. If the slave
        // has no global address yet we fall back to the master's, which
        // strictly violates RFC 3315 but lets servers that key on the
        // relay's own prefix still answer during early startup.
        let link_addr = iface
            .best_source(now)
            .or_else(|| ifaces[0].best_source(now))
            .unwrap_or(Ipv6Addr::UNSPECIFIED);
        let out = build_relay_forward(hop_count, link_addr, *src.ip(), iface.ifindex, payload);
        send_to(
            &self.sock,
            &out,
            SocketAddrV6::new(ALL_DHCPV6_RELAYS_AND_SERVERS, DHCPV6_SERVER_PORT, 0, 0),
            ifaces[0].ifindex,
        );
        debug!(from = %iface.name, hops = hop_count, "relayed client message upstream");
    }

    /// Server → client: unwrap by interface-id and forward down the slave.
    fn relay_reply(&self, cfg: &Config, ifaces: &[Interface], relay: &RelayMessage<'_>, now: u64) {
        let Some(reply) = RelayReply::parse(relay) else {
            debug!("dropping relay-reply without relay-message option");
            return;
        };
        let Some(iface) = reply
            .interface_id
            .and_then(|id| ifaces[1..].iter().find(|i| i.ifindex == id))
        else {
            debug!(interface_id = ?reply.interface_id, "relay-reply for unknown interface");
            return;
        };
        // Nested relay chains go back to another relay, not a client.
        let port = match parse(reply.inner) {
            Some(Packet::Relay(r)) if r.msg_type == MSG_RELAY_REPL => DHCPV6_SERVER_PORT,
            Some(_) => DHCPV6_CLIENT_PORT,
            None => {
                debug!("dropping relay-reply with malformed payload");
                return;
            }
        };
        let rewritten = if cfg.rewrite_dns && port == DHCPV6_CLIENT_PORT {
            let dns = cfg.dns_server.or_else(|| iface.dns_source(now));
            dns.and_then(|d| rewrite_dns_servers(reply.inner, d))
        } else {
            None
        };
        let out = rewritten.as_deref().unwrap_or(reply.inner);
        send_to(
            &self.sock,
            out,
            SocketAddrV6::new(reply.peer_addr, port, 0, 0),
            iface.ifindex,
        );
        debug!(to = %iface.name, port, "relayed server reply downstream");
    }

    fn server_receive(
        &mut self,
        cfg: &Config,
        ifaces: &mut [Interface],
        nl: &mut NetlinkRequest,
        slave: usize,
        msg: &Message<'_>,
        src: SocketAddrV6,
    ) {
        let now = unix_now();
        ifaces[slave + 1].refresh_addresses(nl, now);
        let rt = RouteTable::load().unwrap_or_default();
        let prefixes = onlink_prefixes(&ifaces[slave + 1], &rt);
        let mut fresh_key = [0u8; 16];
        rand::rng().fill_bytes(&mut fresh_key);
        let ctx = ServerContext {
            cfg,
            server_duid: &self.server_duid,
            prefixes: &prefixes,
            now,
            dns: cfg.dns_server.or_else(|| ifaces[slave + 1].dns_source(now)),
            fresh_key,
        };
        let Some(action) = handle_server_message(&ctx, &mut self.bindings[slave], msg, *src.ip())
        else {
            return;
        };
        for op in &action.routes {
            let r = match *op {
                RouteOp::Add { prefix, prefix_len, gateway } => {
                    nl.set_route(prefix, prefix_len, ifaces[slave + 1].ifindex, Some(gateway), true)
                }
                RouteOp::Del { prefix, prefix_len, gateway } => {
                    nl.set_route(prefix, prefix_len, ifaces[slave + 1].ifindex, Some(gateway), false)
                }
            };
            if let Err(e) = r {
                warn!(op = ?op, error = %e, "route update failed");
            }
        }
        if action.persist {
            self.persist(ifaces, &rt, now);
        }
        send_to(&self.sock, &action.reply, src, ifaces[slave + 1].ifindex);
    }

    /// Write the full binding state out and fire the update callback.
    fn persist(&self, ifaces: &[Interface], rt: &RouteTable, now: u64) {
        let Some(store) = &self.lease_store else { return };
        let mut records = Vec::new();
        for (slave, set) in self.bindings.iter().enumerate() {
            let iface = &ifaces[slave + 1];
            let prefixes = onlink_prefixes(iface, rt);
            for b in set.iter() {
                if b.declined() || b.valid_until <= now {
                    continue;
                }
                let addrs = binding_addresses(&prefixes, b, now)
                    .into_iter()
                    .map(|(a, l, ..)| (a, l))
                    .collect();
                records.push(LeaseRecord {
                    ifname: iface.name.clone(),
                    duid: b.client_id.clone(),
                    iaid: b.iaid,
                    hostname: b.hostname.clone(),
                    remaining: b.valid_until.saturating_sub(now),
                    assigned: b.assigned,
                    length: b.length,
                    addrs,
                });
            }
        }
        if let Err(e) = store.write(&records) {
            warn!(error = %e, "lease file update failed");
        }
    }

    /// 2-second maintenance: garbage-collect expired bindings, detect
    /// bindings pushed out of range by prefix changes, and retransmit
    /// pending reconfigures with exponential backoff.
    pub fn sweep(&mut self, cfg: &Config, ifaces: &mut [Interface], nl: &mut NetlinkRequest) {
        if self.mode != Mode::Server {
            return;
        }
        let now = unix_now();
        let rt = RouteTable::load().unwrap_or_default();
        let mut changed = false;

        for slave in 0..self.bindings.len() {
            let prefixes = onlink_prefixes(&ifaces[slave + 1], &rt);
            let expired = self.bindings[slave].sweep_expired(now);
            for b in &expired {
                if b.is_pd() {
                    for (prefix, len, ..) in binding_addresses(&prefixes, b, now) {
                        if let Err(e) =
                            nl.set_route(prefix, len, ifaces[slave + 1].ifindex, Some(b.peer), false)
                        {
                            debug!(error = %e, "expired route removal failed");
                        }
                    }
                }
                info!(iaid = b.iaid, assigned = b.assigned, "binding expired");
            }
            changed |= !expired.is_empty();

            if self.needs_reconf {
                let border = ServerContext {
                    cfg,
                    server_duid: &self.server_duid,
                    prefixes: &prefixes,
                    now,
                    dns: None,
                    fresh_key: [0; 16],
                }
                .border();
                self.bindings[slave].set_border(border);
                schedule_reconfigures(&mut self.bindings[slave], border, now);
            }

            // Retransmit due reconfigures.
            let mut to_send: Vec<(Vec<u8>, Ipv6Addr)> = Vec::new();
            for b in self.bindings[slave].iter_mut() {
                if b.reconf_due == 0 || b.reconf_due > now {
                    continue;
                }
                if b.reconf_attempts >= RECONF_MAX_ATTEMPTS {
                    b.reconf_due = 0;
                    debug!(iaid = b.iaid, "reconfigure abandoned after max attempts");
                    continue;
                }
                self.reconf_replay += 1;
                to_send.push((
                    build_reconfigure(&self.server_duid, b, self.reconf_replay),
                    b.peer,
                ));
                b.reconf_attempts += 1;
                b.reconf_due = now + (1u64 << b.reconf_attempts);
            }
            for (out, peer) in to_send {
                send_to(
                    &self.sock,
                    &out,
                    SocketAddrV6::new(peer, DHCPV6_CLIENT_PORT, 0, 0),
                    ifaces[slave + 1].ifindex,
                );
            }
        }
        self.needs_reconf = false;
        if changed {
            self.persist(ifaces, &rt, now);
        }
    }
}

/// Mark at most one binding per DUID for reconfiguration when its range no
/// longer fits below the border.
pub fn schedule_reconfigures(set: &mut BindingSet, border: u64, now: u64) -> usize {
    let mut seen: Vec<Vec<u8>> = Vec::new();
    let mut marked = 0;
    for b in set.iter_mut() {
        if !b.is_pd() || b.declined() || !b.accept_reconf || b.valid_until <= now {
            continue;
        }
        if b.end() <= border || b.reconf_due != 0 {
            continue;
        }
        if seen.contains(&b.client_id) {
            continue;
        }
        seen.push(b.client_id.clone());
        b.reconf_due = now;
        b.reconf_attempts = 0;
        marked += 1;
    }
    marked
}

/// A RENEW-type RECONFIGURE authenticated with the binding's HMAC-MD5 key.
pub fn build_reconfigure(server_duid: &[u8], binding: &Binding, replay: u64) -> Vec<u8> {
    let mut b = MessageBuilder::new(MSG_RECONFIGURE, [0, 0, 0]);
    b.option(OPT_CLIENTID, &binding.client_id);
    b.option(OPT_SERVERID, server_duid);
    b.option(OPT_RECONF_MSG, &[MSG_RENEW]);
    b.option(OPT_AUTH, &auth_reconf_hmac_payload(replay));
    let mut out = b.finish();
    // The digest is computed over the whole message with its own field
    // zeroed, then patched into the trailing 16 bytes.
    let digest = reconf_hmac(&binding.reconf_key, &out);
    let at = out.len() - 16;
    out[at..].copy_from_slice(&digest);
    out
}

pub fn reconf_hmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("hmac-md5 accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Addresses/prefixes a binding maps to under the current prefix set:
/// `(address-or-prefix, length, preferred, valid)`.
fn binding_addresses(
    prefixes: &[OnlinkPrefix],
    binding: &Binding,
    now: u64,
) -> Vec<(Ipv6Addr, u8, u32, u32)> {
    let mut out = Vec::new();
    for p in prefixes {
        if p.prefix_len > 64 || p.valid_until <= now {
            continue;
        }
        if binding.is_pd() {
            // The assigned block must fit this prefix's capacity.
            if binding.end() > 1u64 << (64 - p.prefix_len) {
                continue;
            }
            out.push((
                delegated_prefix(p.prefix, binding.assigned),
                binding.length,
                p.preferred_remaining(now).min(MAX_LEASE_LIFETIME),
                p.valid_remaining(now).min(MAX_LEASE_LIFETIME),
            ));
        } else {
            out.push((
                na_address(p.prefix, binding.assigned),
                128,
                p.preferred_remaining(now).min(MAX_LEASE_LIFETIME),
                p.valid_remaining(now).min(MAX_LEASE_LIFETIME),
            ));
        }
    }
    out
}

fn parse_oro(options: &[u8]) -> Vec<u16> {
    find_option(options, OPT_ORO)
        .map(|body| body.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
        .unwrap_or_default()
}

fn parse_fqdn_hostname(body: &[u8]) -> Option<String> {
    // Flags byte, then the DNS-encoded name.
    first_dns_label(body.get(1..)?)
}

/// Derive (length, block hint) for a prefix allocation from the client's
/// IA_PD hint.
fn pd_hint(prefixes: &[OnlinkPrefix], ia: &IaRequest) -> (u8, Option<u64>) {
    let Some(hint) = ia.prefixes.first() else {
        return (64, None);
    };
    let length = hint.prefix_len.clamp(1, 64);
    let block = prefixes
        .iter()
        .filter(|p| p.prefix_len <= 64)
        .find(|p| prefix_contains(p.prefix, p.prefix_len, hint.prefix))
        .map(|p| {
            let base = (u128::from_be_bytes(p.prefix.octets()) >> 64) as u64;
            let hinted = (u128::from_be_bytes(hint.prefix.octets()) >> 64) as u64;
            hinted - base
        });
    (length, block)
}

fn ensure_binding(
    ctx: &ServerContext<'_>,
    set: &mut BindingSet,
    client_id: &[u8],
    ia: &IaRequest,
    peer: Ipv6Addr,
) -> IaOutcome {
    if let Some(idx) = set.find(client_id, ia.iaid, ia.is_pd) {
        return IaOutcome::Bound(idx);
    }
    if ctx.prefixes.iter().all(|p| p.prefix_len > 64) {
        return IaOutcome::Fail(if ia.is_pd {
            STATUS_NO_PREFIX_AVAIL
        } else {
            STATUS_NO_ADDRS_AVAIL
        });
    }
    let (length, assigned) = if ia.is_pd {
        let (length, hint) = pd_hint(ctx.prefixes, ia);
        let assigned = set.assign_pd(length, hint).or_else(|| {
            // Squeeze out provisional bindings before giving up.
            if set.reclaim_provisional() { set.assign_pd(length, hint) } else { None }
        });
        (length, assigned)
    } else {
        (128, set.assign_na(client_id))
    };
    let Some(assigned) = assigned else {
        return IaOutcome::Fail(if ia.is_pd {
            STATUS_NO_PREFIX_AVAIL
        } else {
            STATUS_NO_ADDRS_AVAIL
        });
    };
    let binding = Binding::new(client_id, ia.iaid, length, assigned, peer);
    if !set.insert(binding) {
        return IaOutcome::Fail(STATUS_UNSPEC_FAIL);
    }
    match set.find(client_id, ia.iaid, ia.is_pd) {
        Some(idx) => IaOutcome::Bound(idx),
        None => IaOutcome::Fail(STATUS_UNSPEC_FAIL),
    }
}

/// T1/T2 from the shortest usable preferred lifetime: 50% and 80%.
fn timers(ctx: &ServerContext<'_>) -> (u32, u32) {
    let min_preferred = ctx
        .prefixes
        .iter()
        .filter(|p| p.prefix_len <= 64)
        .map(|p| ctx.effective_preferred(p))
        .filter(|p| *p > 0)
        .min()
        .unwrap_or(0);
    (min_preferred / 2, min_preferred * 4 / 5)
}

#[allow(clippy::too_many_arguments)]
fn put_ia_reply(
    b: &mut MessageBuilder,
    ctx: &ServerContext<'_>,
    set: &BindingSet,
    ia: &IaRequest,
    outcome: &IaOutcome,
    invalidate_stale: bool,
) {
    let outer = b.begin_option(if ia.is_pd { OPT_IA_PD } else { OPT_IA_NA });
    let (t1, t2) = timers(ctx);
    b.writer().u32(ia.iaid);
    b.writer().u32(t1);
    b.writer().u32(t2);
    match outcome {
        IaOutcome::Fail(status) => {
            let code = *status;
            let msg = match code {
                STATUS_NO_PREFIX_AVAIL => "no prefixes available",
                STATUS_NO_ADDRS_AVAIL => "no addresses available",
                STATUS_NO_BINDING => "no binding for this IA",
                _ => "request failed",
            };
            let inner = b.begin_option(OPT_STATUS_CODE);
            b.writer().u16(code);
            b.writer().slice(msg.as_bytes());
            b.end_option(inner);
        }
        IaOutcome::Bound(idx) => {
            let binding = set.get(*idx).expect("bound index is valid");
            let offered = binding_addresses(ctx.prefixes, binding, ctx.now);
            for (addr, len, _, valid) in &offered {
                let preferred = ctx
                    .prefixes
                    .iter()
                    .find(|p| prefix_contains(p.prefix, p.prefix_len, *addr))
                    .map(|p| ctx.effective_preferred(p))
                    .unwrap_or(0);
                put_ia_entry(b, ia.is_pd, *addr, *len, preferred, *valid);
            }
            if invalidate_stale {
                // Entries the client still holds but we no longer offer are
                // handed back with zero lifetimes.
                if ia.is_pd {
                    for held in &ia.prefixes {
                        if !offered.iter().any(|(a, l, ..)| *a == held.prefix && *l == held.prefix_len)
                        {
                            put_ia_entry(b, true, held.prefix, held.prefix_len, 0, 0);
                        }
                    }
                } else {
                    for held in &ia.addrs {
                        if !offered.iter().any(|(a, ..)| *a == held.addr) {
                            put_ia_entry(b, false, held.addr, 128, 0, 0);
                        }
                    }
                }
            }
        }
    }
    b.end_option(outer);
}

fn put_ia_entry(
    b: &mut MessageBuilder,
    pd: bool,
    addr: Ipv6Addr,
    len: u8,
    preferred: u32,
    valid: u32,
) {
    if pd {
        let inner = b.begin_option(OPT_IAPREFIX);
        b.writer().u32(preferred);
        b.writer().u32(valid);
        b.writer().u8(len);
        b.writer().addr6(addr);
        b.end_option(inner);
    } else {
        let inner = b.begin_option(OPT_IAADDR);
        b.writer().addr6(addr);
        b.writer().u32(preferred);
        b.writer().u32(valid);
        b.end_option(inner);
    }
}

fn put_common_tail(b: &mut MessageBuilder, ctx: &ServerContext<'_>, oro: &[u16]) {
    if let Some(dns) = ctx.dns {
        b.option(OPT_DNS_SERVERS, &dns.octets());
    }
    if let Some(domain) = &ctx.cfg.search_domain {
        b.option(OPT_DOMAIN_SEARCH, &crate::wire::icmpv6::encode_dns_name(domain));
    }
    if oro.contains(&OPT_SOL_MAX_RT) {
        b.option(OPT_SOL_MAX_RT, &MAX_RT_SECS.to_be_bytes());
    }
    if oro.contains(&OPT_INF_MAX_RT) {
        b.option(OPT_INF_MAX_RT, &MAX_RT_SECS.to_be_bytes());
    }
}

/// The server-side message state machine. Pure over its inputs; kernel
/// route changes come back as [`RouteOp`]s. Returns `None` when the message
/// is malformed or not addressed to us — no reply, no state change.
pub fn handle_server_message(
    ctx: &ServerContext<'_>,
    set: &mut BindingSet,
    msg: &Message<'_>,
    peer: Ipv6Addr,
) -> Option<ServerAction> {
    let client_id = find_option(msg.options, OPT_CLIENTID)?;
    if client_id.is_empty() || client_id.len() > MAX_DUID_LEN {
        return None;
    }
    let server_id = find_option(msg.options, OPT_SERVERID);
    match msg.msg_type {
        MSG_REQUEST | MSG_RENEW | MSG_RELEASE | MSG_DECLINE => {
            if server_id != Some(ctx.server_duid) {
                return None;
            }
        }
        MSG_SOLICIT | MSG_REBIND | MSG_CONFIRM => {
            if server_id.is_some() {
                return None;
            }
        }
        MSG_INFORMATION_REQUEST => {
            if server_id.is_some_and(|s| s != ctx.server_duid) {
                return None;
            }
        }
        _ => return None,
    }
    set.set_border(ctx.border());

    let oro = parse_oro(msg.options);
    let hostname = find_option(msg.options, OPT_FQDN).and_then(parse_fqdn_hostname);
    let accept_reconf = find_option(msg.options, OPT_RECONF_ACCEPT).is_some();
    let rapid = msg.msg_type == MSG_SOLICIT && find_option(msg.options, OPT_RAPID_COMMIT).is_some();
    let ias = IaRequest::all(msg.options);

    let mut action = ServerAction::default();

    match msg.msg_type {
        MSG_SOLICIT | MSG_REQUEST | MSG_RENEW | MSG_REBIND => {
            let commit = msg.msg_type != MSG_SOLICIT || rapid;
            let renew_like = msg.msg_type == MSG_RENEW || msg.msg_type == MSG_REBIND;
            let reply_type = if msg.msg_type == MSG_SOLICIT && !rapid {
                MSG_ADVERTISE
            } else {
                MSG_REPLY
            };
            let mut b = MessageBuilder::new(reply_type, msg.xid);
            b.option(OPT_CLIENTID, client_id);
            b.option(OPT_SERVERID, ctx.server_duid);
            if reply_type == MSG_ADVERTISE {
                b.option(OPT_PREFERENCE, &[ctx.cfg.server_preference]);
            }
            if rapid {
                b.option(OPT_RAPID_COMMIT, &[]);
            }

            let mut delivered_key = false;
            for ia in &ias {
                let outcome = if msg.msg_type == MSG_RENEW {
                    // RENEW must not create state for an unknown IAID.
                    match set.find(client_id, ia.iaid, ia.is_pd) {
                        Some(idx) => IaOutcome::Bound(idx),
                        None => IaOutcome::Fail(STATUS_NO_BINDING),
                    }
                } else {
                    ensure_binding(ctx, set, client_id, ia, peer)
                };
                if let IaOutcome::Bound(idx) = outcome {
                    let lease_valid = binding_addresses(
                        ctx.prefixes,
                        set.get(idx).expect("bound index is valid"),
                        ctx.now,
                    )
                    .iter()
                    .map(|(_, _, _, v)| *v)
                    .max()
                    .unwrap_or(0);
                    let binding = set.get_mut(idx).expect("bound index is valid");
                    binding.peer = peer;
                    binding.accept_reconf = accept_reconf;
                    if hostname.is_some() {
                        binding.hostname = hostname.clone();
                    }
                    if commit {
                        binding.valid_until = ctx.now + u64::from(lease_valid);
                        if accept_reconf && binding.reconf_key == [0; 16] {
                            binding.reconf_key = ctx.fresh_key;
                            delivered_key = true;
                        }
                        let binding = set.get(idx).expect("bound index is valid");
                        if binding.is_pd() {
                            for (prefix, len, _, valid) in
                                binding_addresses(ctx.prefixes, binding, ctx.now)
                            {
                                if valid > 0 {
                                    action.routes.push(RouteOp::Add {
                                        prefix,
                                        prefix_len: len,
                                        gateway: peer,
                                    });
                                }
                            }
                        }
                        action.persist = true;
                    }
                }
                put_ia_reply(&mut b, ctx, set, ia, &outcome, renew_like);
            }
            if delivered_key {
                b.option(OPT_AUTH, &auth_reconf_key_payload(ctx.now, &ctx.fresh_key));
            }
            put_common_tail(&mut b, ctx, &oro);
            action.reply = b.finish();
        }
        MSG_RELEASE => {
            for ia in &ias {
                if let Some(idx) = set.find(client_id, ia.iaid, ia.is_pd) {
                    let binding = set.remove(idx);
                    if binding.is_pd() {
                        for (prefix, len, ..) in binding_addresses(ctx.prefixes, &binding, ctx.now) {
                            action.routes.push(RouteOp::Del {
                                prefix,
                                prefix_len: len,
                                gateway: binding.peer,
                            });
                        }
                    }
                    action.persist = true;
                }
            }
            let mut b = MessageBuilder::new(MSG_REPLY, msg.xid);
            b.option(OPT_CLIENTID, client_id);
            b.option(OPT_SERVERID, ctx.server_duid);
            b.option(OPT_STATUS_CODE, &status_payload(STATUS_SUCCESS, "release received"));
            action.reply = b.finish();
        }
        MSG_DECLINE => {
            // Addresses only: the client saw a DAD conflict. Blank the DUID
            // so the slot stays reserved but unmatchable for an hour.
            for ia in ias.iter().filter(|ia| !ia.is_pd) {
                for held in &ia.addrs {
                    if let Some(idx) = set.find_na_by_suffix(na_suffix(held.addr)) {
                        let binding = set.get_mut(idx).expect("found index is valid");
                        binding.client_id.clear();
                        binding.valid_until = ctx.now + DECLINE_RESERVE_SECS;
                        action.persist = true;
                    }
                }
            }
            let mut b = MessageBuilder::new(MSG_REPLY, msg.xid);
            b.option(OPT_CLIENTID, client_id);
            b.option(OPT_SERVERID, ctx.server_duid);
            b.option(OPT_STATUS_CODE, &status_payload(STATUS_SUCCESS, "decline recorded"));
            action.reply = b.finish();
        }
        MSG_CONFIRM => {
            // Deliberate simplification: always answer NotOnLink so the
            // client restarts its exchange from SOLICIT.
            let mut b = MessageBuilder::new(MSG_REPLY, msg.xid);
            b.option(OPT_CLIENTID, client_id);
            b.option(OPT_SERVERID, ctx.server_duid);
            b.option(OPT_STATUS_CODE, &status_payload(STATUS_NOT_ON_LINK, "confirm not supported"));
            action.reply = b.finish();
        }
        MSG_INFORMATION_REQUEST => {
            let mut b = MessageBuilder::new(MSG_REPLY, msg.xid);
            b.option(OPT_CLIENTID, client_id);
            b.option(OPT_SERVERID, ctx.server_duid);
            put_common_tail(&mut b, ctx, &oro);
            action.reply = b.finish();
        }
        _ => return None,
    }
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::wire::icmpv6::RouterPreference;

    const DUID: &[u8] = &[0, 1, 0, 1, 1, 2, 3, 4, 5, 6];
    const PEER: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x99);
    const SERVER_DUID: &[u8] = &[0, 3, 0, 1, 2, 0, 0, 0, 0, 1];

    fn test_config() -> Config {
        Config {
            master: "wan0".into(),
            slaves: vec!["lan0".into()],
            external: vec![],
            router_discovery: Mode::Disabled,
            dhcpv6: Mode::Server,
            ndp_proxy: false,
            learn_routes: false,
            send_rs: false,
            rewrite_dns: false,
            deprecate_ula: true,
            always_default_router: false,
            preference: RouterPreference::Medium,
            server_preference: 10,
            dns_server: None,
            search_domain: None,
            static_ndp: vec![],
            lease_file: None,
            lease_callback: None,
        }
    }

    fn prefix60(now: u64) -> Vec<OnlinkPrefix> {
        vec![OnlinkPrefix {
            prefix: "2001:db8:0:10::".parse().unwrap(),
            prefix_len: 60,
            preferred_until: now + 3600,
            valid_until: now + 7200,
            ula: false,
        }]
    }

    fn ctx<'a>(cfg: &'a Config, prefixes: &'a [OnlinkPrefix], now: u64) -> ServerContext<'a> {
        ServerContext {
            cfg,
            server_duid: SERVER_DUID,
            prefixes,
            now,
            dns: Some("2001:db8::1".parse().unwrap()),
            fresh_key: [7; 16],
        }
    }

    fn client_message(msg_type: u8, with_server_id: bool, ia: Option<(bool, u32)>) -> Vec<u8> {
        let mut b = MessageBuilder::new(msg_type, [1, 2, 3]);
        b.option(OPT_CLIENTID, DUID);
        if with_server_id {
            b.option(OPT_SERVERID, SERVER_DUID);
        }
        if let Some((pd, iaid)) = ia {
            let outer = b.begin_option(if pd { OPT_IA_PD } else { OPT_IA_NA });
            b.writer().u32(iaid);
            b.writer().u32(0);
            b.writer().u32(0);
            b.end_option(outer);
        }
        b.finish()
    }

    fn parse_msg(buf: &[u8]) -> Message<'_> {
        match parse(buf) {
            Some(Packet::Message(m)) => m,
            _ => panic!("expected client/server message"),
        }
    }

    fn ia_status(reply: &[u8], pd: bool) -> Option<u16> {
        let msg = parse_msg(reply);
        let ia = find_option(msg.options, if pd { OPT_IA_PD } else { OPT_IA_NA })?;
        let sub = &ia[12..];
        find_option(sub, OPT_STATUS_CODE).and_then(parse_status)
    }

    #[test]
    fn test_solicit_then_request_commits_prefix() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = prefix60(now);
        let ctx = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        let solicit = client_message(MSG_SOLICIT, false, Some((true, 0x42)));
        let action = handle_server_message(&ctx, &mut set, &parse_msg(&solicit), PEER).unwrap();
        let advertise = parse_msg(&action.reply);
        assert_eq!(advertise.msg_type, MSG_ADVERTISE);
        assert!(!action.persist);
        assert!(action.routes.is_empty());
        // Provisional: valid-until stays 0 until REQUEST.
        assert_eq!(set.iter().next().unwrap().valid_until, 0);

        let request = client_message(MSG_REQUEST, true, Some((true, 0x42)));
        let action = handle_server_message(&ctx, &mut set, &parse_msg(&request), PEER).unwrap();
        let reply = parse_msg(&action.reply);
        assert_eq!(reply.msg_type, MSG_REPLY);
        assert!(action.persist);
        assert_eq!(
            action.routes,
            vec![RouteOp::Add {
                prefix: "2001:db8:0:10::".parse().unwrap(),
                prefix_len: 64,
                gateway: PEER,
            }]
        );
        let binding = set.iter().next().unwrap();
        assert_eq!(binding.assigned, 0);
        assert_eq!(binding.valid_until, now + 7200);

        // The reply carries the delegated prefix with its lifetimes.
        let ias = IaRequest::all(reply.options);
        assert_eq!(ias.len(), 1);
        assert_eq!(ias[0].prefixes.len(), 1);
        assert_eq!(ias[0].prefixes[0].prefix, "2001:db8:0:10::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(ias[0].prefixes[0].preferred, 3600);
        assert_eq!(ias[0].prefixes[0].valid, 7200);
        assert_eq!(ias[0].t1, 1800);
        assert_eq!(ias[0].t2, 2880);
    }

    #[test]
    fn test_renew_unknown_iaid_is_nobinding() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = prefix60(now);
        let ctx = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        // An existing non-expired binding under another IAID must not match.
        set.set_border(16);
        let mut other = Binding::new(DUID, 0x1, 62, 0, PEER);
        other.valid_until = now + 1000;
        assert!(set.insert(other));

        let renew = client_message(MSG_RENEW, true, Some((true, 0x999)));
        let action = handle_server_message(&ctx, &mut set, &parse_msg(&renew), PEER).unwrap();
        assert_eq!(ia_status(&action.reply, true), Some(STATUS_NO_BINDING));
        assert!(!action.persist);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().iaid, 0x1);
    }

    #[test]
    fn test_decline_blanks_duid_and_reserves() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = vec![OnlinkPrefix {
            prefix: "2001:db8::".parse().unwrap(),
            prefix_len: 64,
            preferred_until: now + 3600,
            valid_until: now + 7200,
            ula: false,
        }];
        let c = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        // Allocate an address via rapid-commit solicit.
        let mut b = MessageBuilder::new(MSG_SOLICIT, [1, 2, 3]);
        b.option(OPT_CLIENTID, DUID);
        b.option(OPT_RAPID_COMMIT, &[]);
        let outer = b.begin_option(OPT_IA_NA);
        b.writer().u32(0x5);
        b.writer().u32(0);
        b.writer().u32(0);
        b.end_option(outer);
        let action = handle_server_message(&c, &mut set, &parse_msg(&b.finish()), PEER).unwrap();
        assert_eq!(parse_msg(&action.reply).msg_type, MSG_REPLY);
        let suffix = set.iter().next().unwrap().assigned;
        let addr = na_address("2001:db8::".parse().unwrap(), suffix);

        // Decline it.
        let mut b = MessageBuilder::new(MSG_DECLINE, [4, 5, 6]);
        b.option(OPT_CLIENTID, DUID);
        b.option(OPT_SERVERID, SERVER_DUID);
        let outer = b.begin_option(OPT_IA_NA);
        b.writer().u32(0x5);
        b.writer().u32(0);
        b.writer().u32(0);
        let inner = b.begin_option(OPT_IAADDR);
        b.writer().addr6(addr);
        b.writer().u32(0);
        b.writer().u32(0);
        b.end_option(inner);
        b.end_option(outer);
        let action = handle_server_message(&c, &mut set, &parse_msg(&b.finish()), PEER).unwrap();
        assert!(action.persist);

        let binding = set.iter().next().unwrap();
        assert!(binding.client_id.is_empty());
        assert_eq!(binding.valid_until, now + DECLINE_RESERVE_SECS);
        // The suffix stays excluded from allocation for the hour.
        assert_ne!(set.assign_na(DUID), Some(suffix));
    }

    #[test]
    fn test_confirm_always_not_on_link() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = prefix60(now);
        let c = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        let confirm = client_message(MSG_CONFIRM, false, Some((false, 1)));
        let action = handle_server_message(&c, &mut set, &parse_msg(&confirm), PEER).unwrap();
        let msg = parse_msg(&action.reply);
        assert_eq!(msg.msg_type, MSG_REPLY);
        assert_eq!(
            find_option(msg.options, OPT_STATUS_CODE).and_then(parse_status),
            Some(STATUS_NOT_ON_LINK)
        );
    }

    #[test]
    fn test_request_wrong_server_id_dropped() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = prefix60(now);
        let c = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        let mut b = MessageBuilder::new(MSG_REQUEST, [1, 2, 3]);
        b.option(OPT_CLIENTID, DUID);
        b.option(OPT_SERVERID, &[0, 3, 0, 1, 9, 9, 9, 9, 9, 9]);
        assert!(handle_server_message(&c, &mut set, &parse_msg(&b.finish()), PEER).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn test_exhaustion_reports_no_prefix_avail() {
        let now = 10_000;
        let cfg = test_config();
        // A /64 on-link prefix leaves exactly one /64 block.
        let prefixes = vec![OnlinkPrefix {
            prefix: "2001:db8:1::".parse().unwrap(),
            prefix_len: 64,
            preferred_until: now + 3600,
            valid_until: now + 7200,
            ula: false,
        }];
        let c = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();

        let req1 = client_message(MSG_REQUEST, true, Some((true, 1)));
        let action = handle_server_message(&c, &mut set, &parse_msg(&req1), PEER).unwrap();
        assert_eq!(ia_status(&action.reply, true), None);

        let other_duid = [0, 1, 0, 1, 9, 9, 9, 9, 9, 9];
        let mut b = MessageBuilder::new(MSG_REQUEST, [1, 2, 3]);
        b.option(OPT_CLIENTID, &other_duid);
        b.option(OPT_SERVERID, SERVER_DUID);
        let outer = b.begin_option(OPT_IA_PD);
        b.writer().u32(2);
        b.writer().u32(0);
        b.writer().u32(0);
        b.end_option(outer);
        let action = handle_server_message(&c, &mut set, &parse_msg(&b.finish()), PEER).unwrap();
        assert_eq!(ia_status(&action.reply, true), Some(STATUS_NO_PREFIX_AVAIL));
    }

    #[test]
    fn test_reconfigure_authentication() {
        let mut binding = Binding::new(DUID, 1, 62, 0, PEER);
        binding.reconf_key = [0xab; 16];
        let out = build_reconfigure(SERVER_DUID, &binding, 42);

        let msg = parse_msg(&out);
        assert_eq!(msg.msg_type, MSG_RECONFIGURE);
        assert_eq!(find_option(msg.options, OPT_RECONF_MSG), Some(&[MSG_RENEW][..]));

        // Zero the digest and recompute: it must match the patched value.
        let auth = find_option(msg.options, OPT_AUTH).unwrap();
        let digest: [u8; 16] = auth[auth.len() - 16..].try_into().unwrap();
        let mut zeroed = out.clone();
        let at = out.len() - 16;
        zeroed[at..].fill(0);
        assert_eq!(reconf_hmac(&binding.reconf_key, &zeroed), digest);
    }

    #[test]
    fn test_schedule_reconfigures_one_per_duid() {
        let now = 10_000;
        let mut set = BindingSet::new();
        set.set_border(32);
        for (iaid, assigned) in [(1u32, 16u64), (2, 20)] {
            let mut b = Binding::new(DUID, iaid, 62, assigned, PEER);
            b.valid_until = now + 1000;
            b.accept_reconf = true;
            assert!(set.insert(b));
        }
        // Border shrinks below both bindings: only one reconfigure per DUID.
        assert_eq!(schedule_reconfigures(&mut set, 16, now), 1);
        let due: Vec<u64> = set.iter().filter(|b| b.reconf_due != 0).map(|b| b.assigned).collect();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_renew_invalidates_withdrawn_prefix() {
        let now = 10_000;
        let cfg = test_config();
        let prefixes = prefix60(now);
        let c = ctx(&cfg, &prefixes, now);
        let mut set = BindingSet::new();
        set.set_border(16);
        let mut b0 = Binding::new(DUID, 0x42, 64, 0, PEER);
        b0.valid_until = now + 1000;
        assert!(set.insert(b0));

        // Client renews holding a prefix from an upstream we lost.
        let mut b = MessageBuilder::new(MSG_RENEW, [1, 2, 3]);
        b.option(OPT_CLIENTID, DUID);
        b.option(OPT_SERVERID, SERVER_DUID);
        let outer = b.begin_option(OPT_IA_PD);
        b.writer().u32(0x42);
        b.writer().u32(0);
        b.writer().u32(0);
        let inner = b.begin_option(OPT_IAPREFIX);
        b.writer().u32(3600);
        b.writer().u32(7200);
        b.writer().u8(64);
        b.writer().addr6("2001:db8:dead::".parse().unwrap());
        b.end_option(inner);
        b.end_option(outer);

        let action = handle_server_message(&c, &mut set, &parse_msg(&b.finish()), PEER).unwrap();
        let ias = IaRequest::all(parse_msg(&action.reply).options);
        let stale = ias[0]
            .prefixes
            .iter()
            .find(|p| p.prefix == "2001:db8:dead::".parse::<Ipv6Addr>().unwrap())
            .unwrap();
        assert_eq!(stale.preferred, 0);
        assert_eq!(stale.valid, 0);
        // The current prefix is still offered alongside.
        assert!(
            ias[0]
                .prefixes
                .iter()
                .any(|p| p.prefix == "2001:db8:0:10::".parse::<Ipv6Addr>().unwrap() && p.valid > 0)
        );
    }
}
