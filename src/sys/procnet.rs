//! Interface and route-table introspection via procfs/sysfs.

use std::io;
use std::net::Ipv6Addr;
use std::path::Path;

/// Kernel interface index from sysfs.
pub fn interface_index(name: &str) -> io::Result<u32> {
    let s = std::fs::read_to_string(format!("/sys/class/net/{name}/ifindex"))?;
    s.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad ifindex"))
}

/// Link-layer address from sysfs (`aa:bb:cc:dd:ee:ff`).
pub fn interface_mac(name: &str) -> io::Result<[u8; 6]> {
    let s = std::fs::read_to_string(format!("/sys/class/net/{name}/address"))?;
    parse_mac(s.trim()).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad mac"))
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() { None } else { Some(mac) }
}

/// Per-interface IPv6 MTU.
pub fn interface_mtu(name: &str) -> io::Result<u32> {
    let s = std::fs::read_to_string(format!("/proc/sys/net/ipv6/conf/{name}/mtu"))?;
    s.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad mtu"))
}

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;
const RTF_REJECT: u32 = 0x0200;

/// Digest of `/proc/net/ipv6_route`: whether a default route exists and
/// which unreachable (reject) prefixes the kernel carries.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    pub have_default: bool,
    pub reject: Vec<(Ipv6Addr, u8)>,
}

impl RouteTable {
    pub fn load() -> io::Result<Self> {
        Self::load_from(Path::new("/proc/net/ipv6_route"))
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Each line: dest(32 hex) destlen(2) src(32) srclen(2) nexthop(32)
    /// metric refcnt use flags(8) devname.
    pub fn parse(text: &str) -> Self {
        let mut table = RouteTable::default();
        for line in text.lines() {
            let mut f = line.split_whitespace();
            let (Some(dest), Some(dest_len)) = (f.next(), f.next()) else {
                continue;
            };
            let Some(flags) = f.nth(6) else { continue };
            let (Some(dest), Some(dest_len), Some(flags)) = (
                parse_hex_addr(dest),
                u8::from_str_radix(dest_len, 16).ok(),
                u32::from_str_radix(flags, 16).ok(),
            ) else {
                continue;
            };
            if flags & RTF_UP == 0 {
                continue;
            }
            if flags & RTF_REJECT != 0 {
                table.reject.push((dest, dest_len));
            } else if dest_len == 0 && flags & RTF_GATEWAY != 0 {
                table.have_default = true;
            }
        }
        table
    }

    /// Refine an address's prefix length by the longest covering reject
    /// route. The kernel holds the delegated aggregate (e.g. a /60) as an
    /// unreachable route while the address itself is configured /64; the
    /// aggregate is the prefix actually at our disposal.
    pub fn refine_prefix_len(&self, addr: Ipv6Addr, prefix_len: u8) -> u8 {
        self.reject
            .iter()
            .filter(|(p, l)| *l < prefix_len && prefix_contains(*p, *l, addr))
            .map(|(_, l)| *l)
            .max()
            .unwrap_or(prefix_len)
    }
}

fn parse_hex_addr(s: &str) -> Option<Ipv6Addr> {
    if s.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, byte) in octets.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(Ipv6Addr::from(octets))
}

pub fn prefix_contains(prefix: Ipv6Addr, prefix_len: u8, addr: Ipv6Addr) -> bool {
    let len = u32::from(prefix_len.min(128));
    if len == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - len);
    (u128::from_be_bytes(prefix.octets()) ^ u128::from_be_bytes(addr.octets())) & mask == 0
}

/// First `search`/`domain` entry of resolv.conf, for the DNSSL option.
pub fn resolv_search_domain() -> Option<String> {
    resolv_search_from(&std::fs::read_to_string("/etc/resolv.conf").ok()?)
}

pub fn resolv_search_from(text: &str) -> Option<String> {
    for line in text.lines() {
        let mut f = line.split_whitespace();
        match f.next() {
            Some("search") | Some("domain") => {
                if let Some(domain) = f.next() {
                    return Some(domain.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003 eth0
20010db8000000100000000000000000 3c 00000000000000000000000000000000 00 00000000000000000000000000000000 00000400 00000000 00000000 00000201 lo
fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001 eth0
";

    #[test]
    fn test_route_table_parse() {
        let t = RouteTable::parse(ROUTES);
        assert!(t.have_default);
        assert_eq!(t.reject, vec![("2001:db8:0:10::".parse().unwrap(), 0x3c)]);
    }

    #[test]
    fn test_refine_prefix_len() {
        let t = RouteTable::parse(ROUTES);
        // /64 address inside the rejected /60 aggregate is widened to /60.
        assert_eq!(t.refine_prefix_len("2001:db8:0:11::1".parse().unwrap(), 64), 60);
        // Address outside the aggregate keeps its own length.
        assert_eq!(t.refine_prefix_len("2001:db8:1::1".parse().unwrap(), 64), 64);
    }

    #[test]
    fn test_parse_garbage_lines() {
        let t = RouteTable::parse("not a route line\n\n00 00\n");
        assert!(!t.have_default);
        assert!(t.reject.is_empty());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("02:00:00:aa:bb:01"), Some([2, 0, 0, 0xaa, 0xbb, 1]));
        assert_eq!(parse_mac("02:00:00:aa:bb"), None);
        assert_eq!(parse_mac("02:00:00:aa:bb:01:02"), None);
        assert_eq!(parse_mac("zz:00:00:aa:bb:01"), None);
    }

    #[test]
    fn test_resolv_search() {
        assert_eq!(
            resolv_search_from("nameserver ::1\nsearch lan.example home\n").as_deref(),
            Some("lan.example")
        );
        assert_eq!(resolv_search_from("nameserver ::1\n"), None);
    }
}
