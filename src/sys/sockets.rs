//! Socket setup and packet I/O.
//!
//! All sockets are non-blocking and close-on-exec. Outbound datagrams pin
//! their egress interface with `IPV6_PKTINFO` ancillary data; inbound
//! datagrams recover the arrival interface the same way (or from the
//! link-layer source address on the packet socket).

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn6, recvmsg, sendmsg,
};
use tracing::warn;

pub const DHCPV6_CLIENT_PORT: u16 = 546;
pub const DHCPV6_SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers (RFC 3315).
pub const ALL_DHCPV6_RELAYS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

const ICMP6_FILTER: libc::c_int = 1;

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

fn socket(domain: libc::c_int, ty: libc::c_int, proto: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto) };
    if fd < 0 {
        return Err(last_err());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn setsockopt_raw<T>(
    fd: RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    value: &T,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(last_err()) } else { Ok(()) }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, v: libc::c_int) -> io::Result<()> {
    setsockopt_raw(fd, level, opt, &v)
}

/// Raw ICMPv6 socket passing only the listed message types. Hop limits are
/// forced to 255 as Neighbor Discovery requires.
pub fn icmp6_socket(pass_types: &[u8]) -> io::Result<OwnedFd> {
    let fd = socket(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6)?;
    let raw = fd.as_raw_fd();

    // icmp6_filter: a set bit blocks the type.
    let mut filter = [0xffff_ffffu32; 8];
    for ty in pass_types {
        filter[usize::from(*ty) >> 5] &= !(1 << (u32::from(*ty) & 31));
    }
    setsockopt_raw(raw, libc::IPPROTO_ICMPV6, ICMP6_FILTER, &filter)?;

    setsockopt_int(raw, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
    setsockopt_int(raw, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, 255)?;
    setsockopt_int(raw, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, 255)?;
    Ok(fd)
}

/// UDP socket bound to the DHCPv6 server port.
pub fn dhcpv6_socket() -> io::Result<OwnedFd> {
    let fd = socket(libc::AF_INET6, libc::SOCK_DGRAM, 0)?;
    let raw = fd.as_raw_fd();
    setsockopt_int(raw, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)?;
    setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(raw, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;

    let addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut addr = libc::sockaddr_in6 { sin6_family: libc::AF_INET6 as libc::sa_family_t, ..addr };
    addr.sin6_port = DHCPV6_SERVER_PORT.to_be();
    let rc = unsafe {
        libc::bind(
            raw,
            &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(fd)
}

/// Join an IPv6 multicast group on a specific interface.
pub fn join_multicast(fd: &OwnedFd, group: Ipv6Addr, ifindex: u32) -> io::Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
        ipv6mr_interface: ifindex,
    };
    setsockopt_raw(fd.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq)
}

/// Classic BPF program admitting only ICMPv6 Neighbor Solicitations.
/// Offsets are relative to the IPv6 header (`SOCK_DGRAM` packet socket).
const NS_FILTER: [libc::sock_filter; 6] = [
    // ldb [6] — next header
    libc::sock_filter { code: 0x30, jt: 0, jf: 0, k: 6 },
    // jne ICMPV6 -> drop
    libc::sock_filter { code: 0x15, jt: 0, jf: 3, k: libc::IPPROTO_ICMPV6 as u32 },
    // ldb [40] — ICMPv6 type
    libc::sock_filter { code: 0x30, jt: 0, jf: 0, k: 40 },
    // jne NEIGHBOR_SOLICIT -> drop
    libc::sock_filter { code: 0x15, jt: 0, jf: 1, k: 135 },
    // accept
    libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: u32::MAX },
    // drop
    libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: 0 },
];

/// Packet socket delivering Neighbor Solicitations from every interface,
/// including frames looped back from our own transmissions.
pub fn ndp_packet_socket() -> io::Result<OwnedFd> {
    let proto = (libc::ETH_P_IPV6 as u16).to_be() as libc::c_int;
    let fd = socket(libc::AF_PACKET, libc::SOCK_DGRAM, proto)?;
    let prog = libc::sock_fprog {
        len: NS_FILTER.len() as libc::c_ushort,
        filter: NS_FILTER.as_ptr() as *mut libc::sock_filter,
    };
    setsockopt_raw(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &prog)?;
    Ok(fd)
}

/// Send a datagram out a specific interface. A zero `ifindex` skips the
/// pktinfo ancillary data (unreliable on raw sockets bound nowhere); the
/// scope id covers link-local and multicast destinations instead. Send
/// failures are logged, never escalated.
pub fn send_to(fd: &OwnedFd, buf: &[u8], mut dst: SocketAddrV6, ifindex: u32) -> bool {
    if dst.scope_id() == 0 && (dst.ip().is_multicast() || is_link_local(*dst.ip())) {
        dst.set_scope_id(ifindex);
    }
    let addr = SockaddrIn6::from(dst);
    let iov = [IoSlice::new(buf)];
    let pktinfo = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr { s6_addr: [0; 16] },
        ipi6_ifindex: ifindex,
    };
    let cmsgs = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
    let cmsgs: &[ControlMessage] = if ifindex == 0 { &[] } else { &cmsgs };
    match sendmsg(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), Some(&addr)) {
        Ok(_) => true,
        Err(e) => {
            warn!(dst = %dst, ifindex, error = %e, "send failed");
            false
        }
    }
}

/// One received datagram with its source and arrival interface.
pub struct Datagram {
    pub len: usize,
    pub src: SocketAddrV6,
    pub ifindex: u32,
}

/// Non-blocking receive with pktinfo extraction. `Ok(None)` means the socket
/// is drained (`EAGAIN`).
pub fn recv_from(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<Option<Datagram>> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!(libc::in6_pktinfo);
    let msg = match recvmsg::<SockaddrIn6>(
        fd.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(m) => m,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(io::Error::from(e)),
    };
    let len = msg.bytes;
    let mut ifindex = 0;
    if let Ok(cmsgs) = msg.cmsgs() {
        for c in cmsgs {
            if let ControlMessageOwned::Ipv6PacketInfo(pi) = c {
                ifindex = pi.ipi6_ifindex;
            }
        }
    }
    let src = msg
        .address
        .map(|a| SocketAddrV6::new(a.ip(), a.port(), 0, a.scope_id()))
        .unwrap_or_else(|| SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));
    Ok(Some(Datagram { len, src, ifindex }))
}

/// Non-blocking receive on the packet socket; the arrival interface comes
/// from the link-layer source address.
pub fn recv_packet(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<Option<(usize, u32)>> {
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut sll_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut sll_len,
        )
    };
    if rc < 0 {
        let e = last_err();
        if e.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(e);
    }
    Ok(Some((rc as usize, sll.sll_ifindex as u32)))
}

pub fn is_link_local(addr: Ipv6Addr) -> bool {
    addr.octets()[0] == 0xfe && addr.octets()[1] & 0xc0 == 0x80
}

/// fc00::/7 — unique local addresses.
pub fn is_ula(addr: Ipv6Addr) -> bool {
    addr.octets()[0] & 0xfe == 0xfc
}

/// Globally routable unicast (2000::/3).
pub fn is_global_unicast(addr: Ipv6Addr) -> bool {
    addr.octets()[0] & 0xe0 == 0x20
}
