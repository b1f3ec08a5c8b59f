//! Daemon configuration, filled in from the command line.

use std::net::Ipv6Addr;
use std::path::PathBuf;

use ipnet::Ipv6Net;

use crate::wire::icmpv6::RouterPreference;

/// Per-protocol operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Disabled,
    /// Forward between master and slaves, rewriting as needed.
    Relay,
    /// Answer on the slaves ourselves.
    Server,
}

impl Mode {
    pub fn enabled(self) -> bool {
        self != Mode::Disabled
    }
}

/// A statically proxied NDP prefix: solicitations for targets inside
/// `prefix` are answered as if the hosts lived behind `ifname`.
#[derive(Debug, Clone)]
pub struct StaticNdpPrefix {
    pub prefix: Ipv6Net,
    pub ifname: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub master: String,
    pub slaves: Vec<String>,
    /// Slave names marked external (DAD/router traffic only).
    pub external: Vec<String>,

    pub router_discovery: Mode,
    pub dhcpv6: Mode,
    pub ndp_proxy: bool,

    /// Mirror learned neighbor locations into the kernel routing table.
    pub learn_routes: bool,
    /// Send one Router Solicitation on the master at startup.
    pub send_rs: bool,
    /// Rewrite DNS server addresses in relayed RAs and DHCPv6 replies.
    pub rewrite_dns: bool,
    /// Advertise ULA prefixes with preferred lifetime 0 while a public
    /// prefix is available.
    pub deprecate_ula: bool,
    /// Announce a default router even without a public prefix.
    pub always_default_router: bool,

    pub preference: RouterPreference,
    /// DHCPv6 server preference (option 7).
    pub server_preference: u8,
    /// RDNSS override; defaults to the interface's best non-ULA address.
    pub dns_server: Option<Ipv6Addr>,
    /// DNSSL override; defaults to the first resolv.conf search domain.
    pub search_domain: Option<String>,

    pub static_ndp: Vec<StaticNdpPrefix>,
    pub lease_file: Option<PathBuf>,
    pub lease_callback: Option<PathBuf>,
}

impl Config {
    /// At least one engine must be active for the daemon to do anything.
    pub fn validate(&self) -> Result<(), String> {
        if self.slaves.is_empty() {
            return Err("at least one slave interface is required".into());
        }
        if !self.router_discovery.enabled() && !self.dhcpv6.enabled() && !self.ndp_proxy {
            return Err("all engines disabled; nothing to do".into());
        }
        for name in &self.external {
            if !self.slaves.iter().any(|s| s == name) {
                return Err(format!("external interface {name} is not a slave"));
            }
        }
        for s in &self.static_ndp {
            if s.ifname != self.master && !self.slaves.iter().any(|n| *n == s.ifname) {
                return Err(format!("static NDP interface {} is not configured", s.ifname));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            master: "wan0".into(),
            slaves: vec!["lan0".into()],
            external: vec![],
            router_discovery: Mode::Server,
            dhcpv6: Mode::Server,
            ndp_proxy: true,
            learn_routes: true,
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

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());

        let mut c = base();
        c.slaves.clear();
        assert!(c.validate().is_err());

        let mut c = base();
        c.router_discovery = Mode::Disabled;
        c.dhcpv6 = Mode::Disabled;
        c.ndp_proxy = false;
        assert!(c.validate().is_err());

        let mut c = base();
        c.external.push("eth9".into());
        assert!(c.validate().is_err());
    }
}
