//! The relay context: owns the registry, the engines, and the event loop.

use anyhow::{Context as _, bail};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::os::fd::{AsFd, BorrowedFd};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dhcpv6::Dhcpv6;
use crate::dispatch::{self, Source};
use crate::interface::Interface;
use crate::ndp::NdpProxy;
use crate::rd::RouterDisc;
use crate::sys::netlink::{NetlinkEvents, NetlinkRequest, RtEvent};
use crate::sys::unix_now;

/// Maintenance sweep period (binding GC, reconfigure backoff, probe aging).
const SWEEP_INTERVAL_SECS: i64 = 2;

pub struct Relay {
    cfg: Config,
    /// Index 0 is the master, the rest are the slaves in config order.
    ifaces: Vec<Interface>,
    nl_req: NetlinkRequest,
    nl_events: NetlinkEvents,
    rd: Option<RouterDisc>,
    dhcp: Option<Dhcpv6>,
    ndp: Option<NdpProxy>,
    sweep: TimerFd,
    signals: SignalFd,
    stop: bool,
}

impl Relay {
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        if let Err(e) = cfg.validate() {
            bail!("invalid configuration: {e}");
        }

        // Signals arrive through the poll loop like everything else.
        let mut mask = SigSet::empty();
        for sig in
            [Signal::SIGTERM, Signal::SIGINT, Signal::SIGUSR1, Signal::SIGHUP, Signal::SIGCHLD]
        {
            mask.add(sig);
        }
        mask.thread_block().context("blocking signals")?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("creating signalfd")?;

        let mut nl_req = NetlinkRequest::connect().context("connecting netlink")?;
        let nl_events = NetlinkEvents::subscribe().context("subscribing to netlink events")?;

        let now = unix_now();
        let mut ifaces = Vec::with_capacity(cfg.slaves.len() + 1);
        let master = Interface::from_system(&cfg.master, false)
            .with_context(|| format!("master interface {}", cfg.master))?;
        ifaces.push(master);
        for name in &cfg.slaves {
            let external = cfg.external.iter().any(|e| e == name);
            ifaces.push(
                Interface::from_system(name, external)
                    .with_context(|| format!("slave interface {name}"))?,
            );
        }
        for iface in &mut ifaces {
            iface.refresh_addresses(&mut nl_req, now);
        }

        let rd = if cfg.router_discovery.enabled() {
            Some(RouterDisc::init(&cfg, &ifaces).context("router discovery init")?)
        } else {
            None
        };
        let dhcp = if cfg.dhcpv6.enabled() {
            Some(Dhcpv6::init(&cfg, &ifaces).context("dhcpv6 init")?)
        } else {
            None
        };
        let ndp = if cfg.ndp_proxy {
            Some(NdpProxy::init(&cfg, &ifaces).context("ndp proxy init")?)
        } else {
            None
        };

        let sweep =
            TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC)
                .context("creating sweep timer")?;
        sweep
            .set(
                Expiration::Interval(TimeSpec::new(SWEEP_INTERVAL_SECS, 0)),
                TimerSetTimeFlags::empty(),
            )
            .context("arming sweep timer")?;

        info!(
            master = %cfg.master,
            slaves = ?cfg.slaves,
            rd = ?cfg.router_discovery,
            dhcpv6 = ?cfg.dhcpv6,
            ndp = cfg.ndp_proxy,
            "relay initialized"
        );
        Ok(Self {
            cfg,
            ifaces,
            nl_req,
            nl_events,
            rd,
            dhcp,
            ndp,
            sweep,
            signals,
            stop: false,
        })
    }

    fn sources(&self) -> Vec<(BorrowedFd<'_>, Source)> {
        let mut out = vec![
            (self.signals.as_fd(), Source::Signal),
            (self.nl_events.as_fd(), Source::Netlink),
            (self.sweep.as_fd(), Source::Sweep),
        ];
        if let Some(rd) = &self.rd {
            out.push((rd.sock_fd(), Source::RouterDisc));
            for i in 0..rd.timer_count() {
                out.push((rd.timer_fd(i), Source::RaTimer(i)));
            }
        }
        if let Some(dhcp) = &self.dhcp {
            out.push((dhcp.sock_fd(), Source::Dhcpv6));
        }
        if let Some(ndp) = &self.ndp {
            out.push((ndp.pkt_fd(), Source::NdpPacket));
        }
        out
    }

    /// Block, dispatch, repeat until a termination signal sets the stop
    /// flag; then withdraw our advertisements and return.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while !self.stop {
            let ready = {
                let sources = self.sources();
                dispatch::wait(&sources).context("poll")?
            };
            for source in ready {
                self.dispatch(source);
            }
        }
        if let Some(rd) = &mut self.rd {
            rd.shutdown(&self.cfg, &mut self.ifaces, &mut self.nl_req);
        }
        info!("relay stopped");
        Ok(())
    }

    fn dispatch(&mut self, source: Source) {
        match source {
            Source::RouterDisc => {
                if let Some(rd) = &mut self.rd {
                    rd.handle_socket(&self.cfg, &mut self.ifaces);
                }
            }
            Source::Dhcpv6 => {
                if let Some(dhcp) = &mut self.dhcp {
                    dhcp.handle_socket(&self.cfg, &mut self.ifaces, &mut self.nl_req);
                }
            }
            Source::NdpPacket => {
                if let Some(ndp) = &mut self.ndp {
                    ndp.handle_packet_socket(&self.ifaces);
                }
            }
            Source::Netlink => {
                for event in self.nl_events.drain() {
                    self.on_rt_event(event);
                }
            }
            Source::RaTimer(slave) => {
                if let Some(rd) = &mut self.rd {
                    rd.handle_timer(slave, &self.cfg, &mut self.ifaces, &mut self.nl_req);
                }
            }
            Source::Sweep => {
                dispatch::drain_timer(&self.sweep);
                if let Some(dhcp) = &mut self.dhcp {
                    dhcp.sweep(&self.cfg, &mut self.ifaces, &mut self.nl_req);
                }
                if let Some(ndp) = &mut self.ndp {
                    ndp.sweep(unix_now());
                }
            }
            Source::Signal => self.on_signal(),
        }
    }

    fn on_rt_event(&mut self, event: RtEvent) {
        match event {
            RtEvent::NewAddr { ifindex, addr, prefix_len }
            | RtEvent::DelAddr { ifindex, addr, prefix_len } => {
                let add = matches!(event, RtEvent::NewAddr { .. });
                let now = unix_now();
                if ifindex == self.ifaces[0].ifindex {
                    // Keep the slaves' kernels addressed like the master,
                    // and let the sweep re-check delegations against the
                    // changed prefix set.
                    if self.cfg.ndp_proxy {
                        for slave in &self.ifaces[1..] {
                            if let Err(e) =
                                self.nl_req.set_address(slave.ifindex, addr, prefix_len, add)
                            {
                                debug!(ifname = %slave.name, %addr, error = %e, "address replay failed");
                            }
                        }
                    }
                    if let Some(dhcp) = &mut self.dhcp {
                        dhcp.mark_needs_reconf();
                    }
                }
                if let Some(pos) = self.ifaces.iter().position(|i| i.ifindex == ifindex) {
                    self.ifaces[pos].refresh_addresses(&mut self.nl_req, now);
                    if pos > 0
                        && let Some(rd) = &self.rd
                    {
                        rd.refresh_slave(pos - 1);
                    }
                }
            }
            RtEvent::NewNeigh { .. } | RtEvent::DelNeigh { .. } => {
                if let Some(ndp) = &mut self.ndp {
                    ndp.handle_neigh_event(&self.cfg, &self.ifaces, &mut self.nl_req, event);
                }
            }
        }
    }

    fn on_signal(&mut self) {
        while let Ok(Some(info)) = self.signals.read_signal() {
            match info.ssi_signo as i32 {
                s if s == Signal::SIGTERM as i32 || s == Signal::SIGINT as i32 => {
                    info!(signal = s, "termination requested");
                    self.stop = true;
                }
                s if s == Signal::SIGUSR1 as i32 || s == Signal::SIGHUP as i32 => {
                    info!("refresh requested");
                    if let Some(rd) = &self.rd {
                        rd.refresh_all();
                    }
                }
                s if s == Signal::SIGCHLD as i32 => reap_children(),
                other => warn!(signal = other, "unexpected signal"),
            }
        }
    }
}

/// Collect exited lease-callback children; their status is ignored.
fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => debug!(?status, "reaped lease callback"),
        }
    }
}
