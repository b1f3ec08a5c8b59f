//! ICMPv6 Neighbor Discovery wire formats.
//!
//! Builders produce the ICMPv6 payload only (no IPv6 header); the raw ICMPv6
//! sockets this daemon sends on let the kernel fill in the checksum. Parsers
//! operate on the ICMPv6 payload as well and ride the fail-closed cursor.

use std::net::Ipv6Addr;

use super::cursor::{Reader, Writer};

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;
pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

pub const OPT_SOURCE_LLADDR: u8 = 1;
pub const OPT_TARGET_LLADDR: u8 = 2;
pub const OPT_PREFIX_INFO: u8 = 3;
pub const OPT_MTU: u8 = 5;
pub const OPT_ROUTE_INFO: u8 = 24;
pub const OPT_RDNSS: u8 = 25;
pub const OPT_DNSSL: u8 = 31;

/// RA flag byte bits.
pub const RA_FLAG_MANAGED: u8 = 0x80;
pub const RA_FLAG_OTHER: u8 = 0x40;
pub const RA_FLAG_PROXIED: u8 = 0x04;

/// NA flag byte bits.
pub const NA_FLAG_ROUTER: u8 = 0x80;
pub const NA_FLAG_SOLICITED: u8 = 0x40;

/// PIO flag byte bits.
pub const PIO_FLAG_ONLINK: u8 = 0x80;
pub const PIO_FLAG_AUTO: u8 = 0x40;

/// Default router preference (RFC 4191), encoded in bits 3-4 of the RA and
/// Route Information flag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterPreference {
    Low,
    #[default]
    Medium,
    High,
}

impl RouterPreference {
    pub fn bits(self) -> u8 {
        match self {
            RouterPreference::High => 0x08,
            RouterPreference::Medium => 0x00,
            RouterPreference::Low => 0x18,
        }
    }
}

/// One ND option: `(type, payload)` without the type/length bytes.
pub struct NdOptionIter<'a> {
    r: Reader<'a>,
}

impl<'a> NdOptionIter<'a> {
    /// Iterate the option block of an ND message. `opts` starts at the first
    /// option byte.
    pub fn new(opts: &'a [u8]) -> Self {
        Self { r: Reader::new(opts) }
    }
}

impl<'a> Iterator for NdOptionIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.r.is_empty() {
            return None;
        }
        let ty = self.r.u8()?;
        let units = self.r.u8()?;
        // A zero length option would loop forever; treat as malformed.
        let total = usize::from(units).checked_mul(8).filter(|n| *n >= 8)?;
        let payload = self.r.take(total - 2)?;
        Some((ty, payload))
    }
}

fn put_nd_option(w: &mut Writer, ty: u8, payload: &[u8]) {
    // Pad the payload so type+len+payload is a multiple of 8 octets.
    let total = (2 + payload.len()).div_ceil(8) * 8;
    w.u8(ty);
    w.u8((total / 8) as u8);
    w.slice(payload);
    for _ in 0..total - 2 - payload.len() {
        w.u8(0);
    }
}

/// A Prefix Information option to be placed in a synthesized RA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaPrefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub onlink: bool,
    pub autonomous: bool,
    pub preferred: u32,
    pub valid: u32,
}

/// A Route Information option to be placed in a synthesized RA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaRoute {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub lifetime: u32,
    pub preference: RouterPreference,
}

/// Everything that goes into one Router Advertisement. Building twice from
/// the same content yields byte-identical output.
#[derive(Debug, Clone, Default)]
pub struct RouterAdvert {
    pub hop_limit: u8,
    pub managed: bool,
    pub other: bool,
    pub preference: RouterPreference,
    pub router_lifetime: u16,
    pub source_lladdr: [u8; 6],
    pub mtu: Option<u32>,
    pub prefixes: Vec<RaPrefix>,
    pub routes: Vec<RaRoute>,
    /// RDNSS servers and their lifetime.
    pub dns_servers: Vec<Ipv6Addr>,
    pub dns_lifetime: u32,
    /// DNSSL search domain (at most one) and its lifetime.
    pub search_domain: Option<String>,
}

impl RouterAdvert {
    pub fn build(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(ND_ROUTER_ADVERT);
        w.u8(0); // code
        w.u16(0); // checksum, filled by the kernel
        w.u8(self.hop_limit);
        let mut flags = self.preference.bits();
        if self.managed {
            flags |= RA_FLAG_MANAGED;
        }
        if self.other {
            flags |= RA_FLAG_OTHER;
        }
        w.u8(flags);
        w.u16(self.router_lifetime);
        w.u32(0); // reachable time, unspecified
        w.u32(0); // retrans timer, unspecified

        put_nd_option(&mut w, OPT_SOURCE_LLADDR, &self.source_lladdr);

        if let Some(mtu) = self.mtu {
            let mut p = Writer::new();
            p.u16(0); // reserved
            p.u32(mtu);
            put_nd_option(&mut w, OPT_MTU, p.as_slice());
        }

        for pfx in &self.prefixes {
            let mut p = Writer::new();
            p.u8(pfx.prefix_len);
            let mut f = 0u8;
            if pfx.onlink {
                f |= PIO_FLAG_ONLINK;
            }
            if pfx.autonomous {
                f |= PIO_FLAG_AUTO;
            }
            p.u8(f);
            p.u32(pfx.valid);
            p.u32(pfx.preferred);
            p.u32(0); // reserved
            p.addr6(pfx.prefix);
            put_nd_option(&mut w, OPT_PREFIX_INFO, p.as_slice());
        }

        for rt in &self.routes {
            let mut p = Writer::new();
            p.u8(rt.prefix_len);
            p.u8(rt.preference.bits());
            p.u32(rt.lifetime);
            // Prefix is carried in as few 8-octet units as its length needs.
            let bytes = usize::from(rt.prefix_len).div_ceil(64) * 8;
            p.slice(&rt.prefix.octets()[..bytes]);
            put_nd_option(&mut w, OPT_ROUTE_INFO, p.as_slice());
        }

        if !self.dns_servers.is_empty() {
            let mut p = Writer::new();
            p.u16(0); // reserved
            p.u32(self.dns_lifetime);
            for a in &self.dns_servers {
                p.addr6(*a);
            }
            put_nd_option(&mut w, OPT_RDNSS, p.as_slice());
        }

        if let Some(domain) = &self.search_domain {
            let mut p = Writer::new();
            p.u16(0); // reserved
            p.u32(self.dns_lifetime);
            p.slice(&encode_dns_name(domain));
            put_nd_option(&mut w, OPT_DNSSL, p.as_slice());
        }

        w.into_vec()
    }
}

/// Encode a domain name as DNS labels (RFC 1035 wire encoding).
pub fn encode_dns_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.') {
        let label = label.as_bytes();
        if label.is_empty() || label.len() > 63 {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    out
}

/// Decode the first DNS label of an RFC 1035 encoded name.
pub fn first_dns_label(encoded: &[u8]) -> Option<String> {
    let mut r = Reader::new(encoded);
    let len = usize::from(r.u8()?);
    if len == 0 || len > 63 {
        return None;
    }
    let label = r.take(len)?;
    let s: String = label
        .iter()
        .map(|b| *b as char)
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if s.is_empty() { None } else { Some(s) }
}

/// Rewrite a received Router Advertisement for retransmission on a slave
/// link: swap the source link-layer address for the slave's own, mark the
/// advertisement as proxied, and (optionally) replace the RDNSS payload.
/// Returns `None` if the RA is malformed.
pub fn rewrite_router_advert(
    payload: &[u8],
    lladdr: [u8; 6],
    dns_rewrite: Option<Ipv6Addr>,
) -> Option<Vec<u8>> {
    let mut r = Reader::new(payload);
    let ty = r.u8()?;
    if ty != ND_ROUTER_ADVERT || r.u8()? != 0 {
        return None;
    }
    r.u16()?; // checksum, recomputed by the kernel on send
    let hop_limit = r.u8()?;
    let flags = r.u8()?;
    let lifetime = r.u16()?;
    let reachable = r.u32()?;
    let retrans = r.u32()?;

    let mut w = Writer::new();
    w.u8(ND_ROUTER_ADVERT);
    w.u8(0);
    w.u16(0);
    w.u8(hop_limit);
    w.u8(flags | RA_FLAG_PROXIED);
    w.u16(lifetime);
    w.u32(reachable);
    w.u32(retrans);

    let mut have_slladdr = false;
    for (ty, body) in NdOptionIter::new(r.rest()) {
        match ty {
            OPT_SOURCE_LLADDR => {
                put_nd_option(&mut w, OPT_SOURCE_LLADDR, &lladdr);
                have_slladdr = true;
            }
            OPT_RDNSS => {
                if let Some(addr) = dns_rewrite {
                    let mut p = Writer::new();
                    let mut b = Reader::new(body);
                    b.u16()?;
                    p.u16(0);
                    p.u32(b.u32()?); // keep the advertised lifetime
                    p.addr6(addr);
                    put_nd_option(&mut w, OPT_RDNSS, p.as_slice());
                } else {
                    put_nd_option(&mut w, OPT_RDNSS, body);
                }
            }
            _ => put_nd_option(&mut w, ty, body),
        }
    }
    if !have_slladdr {
        put_nd_option(&mut w, OPT_SOURCE_LLADDR, &lladdr);
    }
    Some(w.into_vec())
}

/// Build a plain Router Solicitation with a source link-layer option.
pub fn build_router_solicit(lladdr: [u8; 6]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(ND_ROUTER_SOLICIT);
    w.u8(0);
    w.u16(0);
    w.u32(0); // reserved
    put_nd_option(&mut w, OPT_SOURCE_LLADDR, &lladdr);
    w.into_vec()
}

/// Extract the target address of a Neighbor Solicitation payload.
pub fn parse_neighbor_solicit(payload: &[u8]) -> Option<Ipv6Addr> {
    let mut r = Reader::new(payload);
    if r.u8()? != ND_NEIGHBOR_SOLICIT || r.u8()? != 0 {
        return None;
    }
    r.u16()?; // checksum
    r.u32()?; // reserved
    r.addr6()
}

/// Build a Neighbor Advertisement with a target link-layer option.
pub fn build_neighbor_advert(target: Ipv6Addr, flags: u8, lladdr: [u8; 6]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(ND_NEIGHBOR_ADVERT);
    w.u8(0);
    w.u16(0);
    w.u8(flags);
    w.u8(0);
    w.u16(0);
    w.addr6(target);
    put_nd_option(&mut w, OPT_TARGET_LLADDR, &lladdr);
    w.into_vec()
}

/// Build an ICMPv6 Echo Request (used as a neighbor probe).
pub fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(ICMPV6_ECHO_REQUEST);
    w.u8(0);
    w.u16(0);
    w.u16(ident);
    w.u16(seq);
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xaa, 0xbb, 0x01];

    #[test]
    fn test_ra_build_parse() {
        let ra = RouterAdvert {
            hop_limit: 64,
            managed: true,
            other: true,
            router_lifetime: 1800,
            source_lladdr: MAC,
            mtu: Some(1500),
            prefixes: vec![RaPrefix {
                prefix: "2001:db8::".parse().unwrap(),
                prefix_len: 64,
                onlink: true,
                autonomous: true,
                preferred: 3600,
                valid: 7200,
            }],
            dns_servers: vec!["2001:db8::1".parse().unwrap()],
            dns_lifetime: 3600,
            search_domain: Some("lan".into()),
            ..Default::default()
        };
        let buf = ra.build();
        assert_eq!(buf[0], ND_ROUTER_ADVERT);
        assert_eq!(buf[5] & RA_FLAG_MANAGED, RA_FLAG_MANAGED);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 1800);

        let kinds: Vec<u8> = NdOptionIter::new(&buf[16..]).map(|(t, _)| t).collect();
        assert_eq!(
            kinds,
            vec![OPT_SOURCE_LLADDR, OPT_MTU, OPT_PREFIX_INFO, OPT_RDNSS, OPT_DNSSL]
        );
    }

    #[test]
    fn test_ra_build_idempotent() {
        let ra = RouterAdvert {
            hop_limit: 64,
            router_lifetime: 0,
            source_lladdr: MAC,
            mtu: Some(1280),
            ..Default::default()
        };
        assert_eq!(ra.build(), ra.build());
    }

    #[test]
    fn test_option_iter_truncated() {
        // Claims 2 units (16 bytes) but only 6 bytes follow the header.
        let buf = [OPT_SOURCE_LLADDR, 2, 0, 0, 0, 0, 0, 0];
        assert_eq!(NdOptionIter::new(&buf).count(), 0);
    }

    #[test]
    fn test_option_iter_zero_length() {
        let buf = [OPT_MTU, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(NdOptionIter::new(&buf).count(), 0);
    }

    #[test]
    fn test_rewrite_ra_sets_proxy_and_mac() {
        let ra = RouterAdvert {
            hop_limit: 64,
            router_lifetime: 600,
            source_lladdr: [1, 2, 3, 4, 5, 6],
            dns_servers: vec!["2001:db8::53".parse().unwrap()],
            dns_lifetime: 600,
            ..Default::default()
        };
        let out = rewrite_router_advert(&ra.build(), MAC, Some("fd00::53".parse().unwrap()))
            .expect("rewrite failed");
        assert_eq!(out[5] & RA_FLAG_PROXIED, RA_FLAG_PROXIED);

        let mut saw_lladdr = false;
        let mut saw_dns = false;
        for (ty, body) in NdOptionIter::new(&out[16..]) {
            match ty {
                OPT_SOURCE_LLADDR => {
                    assert_eq!(&body[..6], &MAC);
                    saw_lladdr = true;
                }
                OPT_RDNSS => {
                    assert_eq!(&body[6..22], &"fd00::53".parse::<Ipv6Addr>().unwrap().octets());
                    saw_dns = true;
                }
                _ => {}
            }
        }
        assert!(saw_lladdr && saw_dns);
    }

    #[test]
    fn test_ns_parse() {
        let na = build_neighbor_advert("2001:db8::5".parse().unwrap(), NA_FLAG_ROUTER, MAC);
        // An NA is not an NS.
        assert_eq!(parse_neighbor_solicit(&na), None);

        let mut ns = vec![ND_NEIGHBOR_SOLICIT, 0, 0, 0, 0, 0, 0, 0];
        ns.extend_from_slice(&"2001:db8::5".parse::<Ipv6Addr>().unwrap().octets());
        assert_eq!(parse_neighbor_solicit(&ns), Some("2001:db8::5".parse().unwrap()));
        // Truncated target.
        assert_eq!(parse_neighbor_solicit(&ns[..20]), None);
    }

    #[test]
    fn test_dns_name_encoding() {
        assert_eq!(encode_dns_name("example.org"), b"\x07example\x03org\x00");
        assert_eq!(first_dns_label(b"\x07example\x03org\x00").as_deref(), Some("example"));
        assert_eq!(first_dns_label(b"\x00"), None);
        assert_eq!(first_dns_label(b"\x40"), None);
    }
}
