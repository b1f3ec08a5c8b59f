use std::net::Ipv6Addr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use relay6d::config::{Config, Mode, StaticNdpPrefix};
use relay6d::relay::Relay;
use relay6d::wire::icmpv6::RouterPreference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum ModeArg {
    #[default]
    Disabled,
    Relay,
    Server,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Disabled => Mode::Disabled,
            ModeArg::Relay => Mode::Relay,
            ModeArg::Server => Mode::Server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum PreferenceArg {
    Low,
    #[default]
    Medium,
    High,
}

impl From<PreferenceArg> for RouterPreference {
    fn from(p: PreferenceArg) -> Self {
        match p {
            PreferenceArg::Low => RouterPreference::Low,
            PreferenceArg::Medium => RouterPreference::Medium,
            PreferenceArg::High => RouterPreference::High,
        }
    }
}

/// IPv6 router-helper: relays or serves Router Discovery, DHCPv6 and NDP
/// between one upstream link and the downstream links behind it.
#[derive(Debug, Parser)]
#[command(name = "relay6d", version)]
struct Args {
    /// Upstream (master) interface
    master: String,

    /// Downstream (slave) interfaces
    #[arg(required = true)]
    slaves: Vec<String>,

    /// Router Discovery mode
    #[arg(long, value_enum, default_value = "disabled")]
    router_discovery: ModeArg,

    /// DHCPv6 mode
    #[arg(long, value_enum, default_value = "disabled")]
    dhcpv6: ModeArg,

    /// Proxy Neighbor Discovery between the configured links
    #[arg(long)]
    ndp_proxy: bool,

    /// Mirror learned neighbor locations into the kernel routing table
    #[arg(long)]
    learn_routes: bool,

    /// Mark a slave as external: only DAD and router traffic is proxied
    #[arg(long, value_name = "IFACE")]
    external: Vec<String>,

    /// Send a Router Solicitation on the master at startup
    #[arg(long)]
    send_router_solicitation: bool,

    /// Rewrite DNS server addresses in relayed RAs and DHCPv6 replies
    #[arg(long)]
    rewrite_dns: bool,

    /// Advertise ULA prefixes as deprecated while a public prefix exists
    #[arg(long)]
    deprecate_ula: bool,

    /// Announce a default router even without a public prefix
    #[arg(long)]
    always_default_router: bool,

    /// Default router preference advertised to hosts
    #[arg(long, value_enum, default_value = "medium")]
    preference: PreferenceArg,

    /// DHCPv6 server preference (option 7)
    #[arg(long, default_value_t = 0)]
    server_preference: u8,

    /// DNS server to advertise instead of the interface address
    #[arg(long, value_name = "ADDR")]
    dns_server: Option<Ipv6Addr>,

    /// DNS search domain to advertise instead of resolv.conf's
    #[arg(long, value_name = "DOMAIN")]
    search_domain: Option<String>,

    /// Statically proxied NDP prefix, as PREFIX@IFACE (repeatable)
    #[arg(long, value_name = "PREFIX@IFACE", value_parser = parse_static_ndp)]
    ndp_prefix: Vec<StaticNdpPrefix>,

    /// DHCPv6 lease file
    #[arg(long, value_name = "PATH")]
    lease_file: Option<PathBuf>,

    /// Program spawned after every lease file update
    #[arg(long, value_name = "PATH")]
    lease_callback: Option<PathBuf>,
}

fn parse_static_ndp(s: &str) -> Result<StaticNdpPrefix, String> {
    let (prefix, ifname) = s.split_once('@').ok_or_else(|| "expected PREFIX@IFACE".to_string())?;
    Ok(StaticNdpPrefix {
        prefix: prefix.parse().map_err(|e| format!("bad prefix: {e}"))?,
        ifname: ifname.to_string(),
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config {
        master: args.master,
        slaves: args.slaves,
        external: args.external,
        router_discovery: args.router_discovery.into(),
        dhcpv6: args.dhcpv6.into(),
        ndp_proxy: args.ndp_proxy,
        learn_routes: args.learn_routes,
        send_rs: args.send_router_solicitation,
        rewrite_dns: args.rewrite_dns,
        deprecate_ula: args.deprecate_ula,
        always_default_router: args.always_default_router,
        preference: args.preference.into(),
        server_preference: args.server_preference,
        dns_server: args.dns_server,
        search_domain: args.search_domain,
        static_ndp: args.ndp_prefix,
        lease_file: args.lease_file,
        lease_callback: args.lease_callback,
    };

    let mut relay = Relay::new(cfg).context("startup failed")?;
    relay.run()
}
