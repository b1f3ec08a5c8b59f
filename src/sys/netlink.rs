//! Minimal rtnetlink client.
//!
//! Two sockets: a blocking request socket for address dumps and route/address
//! changes, and a non-blocking socket subscribed to the IPv6 address and
//! neighbor multicast groups that feeds change notifications into the event
//! loop. Messages are built and parsed with the wire cursor; netlink headers
//! are host byte order, addresses network order.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::libc;
use thiserror::Error;

use crate::wire::cursor::{Reader, Writer};

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const RTM_GETADDR: u16 = 22;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_NEWNEIGH: u16 = 28;
const RTM_DELNEIGH: u16 = 29;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_REPLACE: u16 = 0x0100;
const NLM_F_CREATE: u16 = 0x0400;
const NLM_F_DUMP: u16 = 0x0300;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_CACHEINFO: u16 = 6;
const IFA_FLAGS: u16 = 8;
const IFA_F_DEPRECATED: u32 = 0x20;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const NDA_DST: u16 = 1;

const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
const RT_TABLE_MAIN: u8 = 254;
const RTN_UNICAST: u8 = 1;
const RTPROT_STATIC: u8 = 4;

const RTMGRP_NEIGH: u32 = 0x4;
const RTMGRP_IPV6_IFADDR: u32 = 0x100;

/// Neighbor states that mean the kernel located the neighbor.
pub const NUD_VALID: u16 = 0x02 | 0x04 | 0x08 | 0x10 | 0x40 | 0x80;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("netlink io: {0}")]
    Io(#[from] io::Error),
    #[error("kernel refused request: errno {0}")]
    Kernel(i32),
    #[error("truncated netlink message")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

/// A global address on an interface, lifetimes in relative seconds
/// (`u32::MAX` = infinite, preferred 0 = deprecated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub preferred: u32,
    pub valid: u32,
}

/// Address/neighbor change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtEvent {
    NewAddr { ifindex: u32, addr: Ipv6Addr, prefix_len: u8 },
    DelAddr { ifindex: u32, addr: Ipv6Addr, prefix_len: u8 },
    NewNeigh { ifindex: u32, addr: Ipv6Addr, state: u16 },
    DelNeigh { ifindex: u32, addr: Ipv6Addr },
}

fn netlink_socket(groups: u32, nonblocking: bool) -> io::Result<OwnedFd> {
    let mut ty = libc::SOCK_RAW | libc::SOCK_CLOEXEC;
    if nonblocking {
        ty |= libc::SOCK_NONBLOCK;
    }
    let fd = unsafe { libc::socket(libc::AF_NETLINK, ty, libc::NETLINK_ROUTE) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = groups;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn put_header(w: &mut Writer, msg_type: u16, flags: u16, seq: u32) {
    w.slice(&0u32.to_ne_bytes()); // length, patched below
    w.slice(&msg_type.to_ne_bytes());
    w.slice(&flags.to_ne_bytes());
    w.slice(&seq.to_ne_bytes());
    w.slice(&0u32.to_ne_bytes()); // pid
}

fn finish_message(mut w: Writer) -> Vec<u8> {
    let len = (w.len() as u32).to_ne_bytes();
    w.as_mut_slice()[0..4].copy_from_slice(&len);
    w.into_vec()
}

fn put_attr(w: &mut Writer, ty: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    w.slice(&(len as u16).to_ne_bytes());
    w.slice(&ty.to_ne_bytes());
    w.slice(payload);
    for _ in 0..(4 - len % 4) % 4 {
        w.u8(0);
    }
}

/// One parsed netlink message.
struct NlMsg<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

fn parse_messages(buf: &[u8]) -> Vec<NlMsg<'_>> {
    let mut out = Vec::new();
    let mut r = Reader::new(buf);
    loop {
        if r.remaining() < 16 {
            break;
        }
        let Some(len) = r.u32_ne() else { break };
        let Some(msg_type) = r.u16_ne() else { break };
        let (Some(_flags), Some(_seq), Some(_pid)) = (r.u16_ne(), r.u32_ne(), r.u32_ne()) else {
            break;
        };
        let len = len as usize;
        if len < 16 {
            break;
        }
        let Some(payload) = r.take(len - 16) else { break };
        out.push(NlMsg { msg_type, payload });
        // Messages are 4-byte aligned.
        let pad = (4 - len % 4) % 4;
        if r.skip(pad.min(r.remaining())).is_none() {
            break;
        }
    }
    out
}

/// Attribute walk over the tail of an rtnetlink message.
fn attrs(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut r = Reader::new(data);
    loop {
        if r.remaining() < 4 {
            break;
        }
        let (Some(len), Some(ty)) = (r.u16_ne(), r.u16_ne()) else { break };
        let len = usize::from(len);
        if len < 4 {
            break;
        }
        let Some(payload) = r.take(len - 4) else { break };
        out.push((ty, payload));
        let pad = (4 - len % 4) % 4;
        if r.skip(pad.min(r.remaining())).is_none() {
            break;
        }
    }
    out
}

fn attr_addr6(payload: &[u8]) -> Option<Ipv6Addr> {
    Reader::new(payload).addr6()
}

/// Blocking request socket for dumps and route/address changes.
pub struct NetlinkRequest {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkRequest {
    pub fn connect() -> Result<Self> {
        Ok(Self { fd: netlink_socket(0, false)?, seq: 1 })
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        let rc = unsafe {
            libc::send(self.fd.as_raw_fd(), msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn recv<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        let rc = unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(&buf[..rc as usize])
    }

    /// Dump the interface's universe-scope IPv6 addresses, at most `cap`
    /// entries; the remainder of the dump is drained and discarded.
    pub fn dump_addresses(&mut self, ifindex: u32, cap: usize) -> Result<Vec<AddrInfo>> {
        self.seq += 1;
        let mut w = Writer::new();
        put_header(&mut w, RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP, self.seq);
        // ifaddrmsg
        w.u8(libc::AF_INET6 as u8);
        w.u8(0); // prefixlen
        w.u8(0); // flags
        w.u8(0); // scope
        w.slice(&ifindex.to_ne_bytes());
        self.send(&finish_message(w))?;

        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        'dump: loop {
            let data = self.recv(&mut buf)?;
            if data.is_empty() {
                return Err(NetlinkError::Truncated);
            }
            for msg in parse_messages(data) {
                match msg.msg_type {
                    NLMSG_DONE => break 'dump,
                    NLMSG_ERROR => {
                        let errno = Reader::new(msg.payload).u32_ne().unwrap_or(0) as i32;
                        if errno != 0 {
                            return Err(NetlinkError::Kernel(-errno));
                        }
                        break 'dump;
                    }
                    RTM_NEWADDR => {
                        if let Some(info) = parse_ifaddr(msg.payload, Some(ifindex))
                            && out.len() < cap
                        {
                            out.push(info);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(out)
    }

    fn transact(&mut self, msg: Vec<u8>) -> Result<()> {
        self.send(&msg)?;
        let mut buf = [0u8; 1024];
        let data = self.recv(&mut buf)?;
        for msg in parse_messages(data) {
            if msg.msg_type == NLMSG_ERROR {
                let errno = Reader::new(msg.payload).u32_ne().unwrap_or(0) as i32;
                if errno != 0 {
                    return Err(NetlinkError::Kernel(-errno));
                }
            }
        }
        Ok(())
    }

    /// Install or remove a route through `ifindex`, optionally via a
    /// gateway (a delegated-prefix next hop or a learned neighbor).
    pub fn set_route(
        &mut self,
        prefix: Ipv6Addr,
        prefix_len: u8,
        ifindex: u32,
        gateway: Option<Ipv6Addr>,
        add: bool,
    ) -> Result<()> {
        self.seq += 1;
        let mut w = Writer::new();
        let (msg_type, flags) = if add {
            (RTM_NEWROUTE, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE)
        } else {
            (RTM_DELROUTE, NLM_F_REQUEST | NLM_F_ACK)
        };
        put_header(&mut w, msg_type, flags, self.seq);
        // rtmsg
        w.u8(libc::AF_INET6 as u8);
        w.u8(prefix_len);
        w.u8(0); // src_len
        w.u8(0); // tos
        w.u8(RT_TABLE_MAIN);
        w.u8(if add { RTPROT_STATIC } else { 0 });
        w.u8(if gateway.is_some() { RT_SCOPE_UNIVERSE } else { RT_SCOPE_LINK });
        w.u8(if add { RTN_UNICAST } else { 0 });
        w.slice(&0u32.to_ne_bytes()); // rtm_flags
        put_attr(&mut w, RTA_DST, &prefix.octets());
        put_attr(&mut w, RTA_OIF, &ifindex.to_ne_bytes());
        if let Some(gw) = gateway {
            put_attr(&mut w, RTA_GATEWAY, &gw.octets());
        }
        self.transact(finish_message(w))
    }

    /// Mirror an address add/remove onto another interface (used to replay
    /// master address changes on the slaves).
    pub fn set_address(
        &mut self,
        ifindex: u32,
        addr: Ipv6Addr,
        prefix_len: u8,
        add: bool,
    ) -> Result<()> {
        self.seq += 1;
        let mut w = Writer::new();
        let (msg_type, flags) = if add {
            (RTM_NEWADDR, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE)
        } else {
            (RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK)
        };
        put_header(&mut w, msg_type, flags, self.seq);
        // ifaddrmsg
        w.u8(libc::AF_INET6 as u8);
        w.u8(prefix_len);
        w.u8(0);
        w.u8(RT_SCOPE_UNIVERSE);
        w.slice(&ifindex.to_ne_bytes());
        put_attr(&mut w, IFA_LOCAL, &addr.octets());
        put_attr(&mut w, IFA_ADDRESS, &addr.octets());
        self.transact(finish_message(w))
    }
}

fn parse_ifaddr(payload: &[u8], want_ifindex: Option<u32>) -> Option<AddrInfo> {
    let mut r = Reader::new(payload);
    let family = r.u8()?;
    let prefix_len = r.u8()?;
    let _flags = r.u8()?;
    let scope = r.u8()?;
    let ifindex = r.u32_ne()?;
    if family != libc::AF_INET6 as u8 || scope != RT_SCOPE_UNIVERSE {
        return None;
    }
    if let Some(want) = want_ifindex
        && ifindex != want
    {
        return None;
    }
    let mut addr = None;
    let mut preferred = u32::MAX;
    let mut valid = u32::MAX;
    let mut ext_flags = 0u32;
    for (ty, body) in attrs(r.rest()) {
        match ty {
            IFA_ADDRESS | IFA_LOCAL => addr = attr_addr6(body),
            IFA_CACHEINFO => {
                let mut c = Reader::new(body);
                preferred = c.u32_ne()?;
                valid = c.u32_ne()?;
            }
            IFA_FLAGS => ext_flags = Reader::new(body).u32_ne()?,
            _ => {}
        }
    }
    if ext_flags & IFA_F_DEPRECATED != 0 {
        preferred = 0;
    }
    Some(AddrInfo { addr: addr?, prefix_len, preferred, valid })
}

/// Non-blocking socket subscribed to IPv6 address and neighbor changes.
pub struct NetlinkEvents {
    fd: OwnedFd,
}

impl NetlinkEvents {
    pub fn subscribe() -> Result<Self> {
        Ok(Self { fd: netlink_socket(RTMGRP_IPV6_IFADDR | RTMGRP_NEIGH, true)? })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Drain all pending notifications.
    pub fn drain(&self) -> Vec<RtEvent> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if rc <= 0 {
                break;
            }
            for msg in parse_messages(&buf[..rc as usize]) {
                if let Some(ev) = parse_event(msg.msg_type, msg.payload) {
                    out.push(ev);
                }
            }
        }
        out
    }
}

fn parse_event(msg_type: u16, payload: &[u8]) -> Option<RtEvent> {
    match msg_type {
        RTM_NEWADDR | RTM_DELADDR => {
            let mut r = Reader::new(payload);
            let family = r.u8()?;
            let prefix_len = r.u8()?;
            let _flags = r.u8()?;
            let scope = r.u8()?;
            let ifindex = r.u32_ne()?;
            if family != libc::AF_INET6 as u8 || scope != RT_SCOPE_UNIVERSE {
                return None;
            }
            let addr = attrs(r.rest())
                .into_iter()
                .find(|(t, _)| *t == IFA_ADDRESS || *t == IFA_LOCAL)
                .and_then(|(_, b)| attr_addr6(b))?;
            Some(if msg_type == RTM_NEWADDR {
                RtEvent::NewAddr { ifindex, addr, prefix_len }
            } else {
                RtEvent::DelAddr { ifindex, addr, prefix_len }
            })
        }
        RTM_NEWNEIGH | RTM_DELNEIGH => {
            let mut r = Reader::new(payload);
            let family = r.u8()?;
            r.skip(3)?; // padding
            let ifindex = r.u32_ne()?;
            let state = r.u16_ne()?;
            let _flags = r.u8()?;
            let _ntype = r.u8()?;
            if family != libc::AF_INET6 as u8 {
                return None;
            }
            let addr = attrs(r.rest())
                .into_iter()
                .find(|(t, _)| *t == NDA_DST)
                .and_then(|(_, b)| attr_addr6(b))?;
            Some(if msg_type == RTM_NEWNEIGH {
                RtEvent::NewNeigh { ifindex, addr, state }
            } else {
                RtEvent::DelNeigh { ifindex, addr }
            })
        }
        _ => None,
    }
}
