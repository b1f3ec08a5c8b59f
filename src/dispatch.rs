//! Readiness dispatch.
//!
//! Every event source — protocol sockets, the netlink notification socket,
//! per-slave RA timers, the sweep timer, the signalfd — is registered once as
//! a `(fd, Source)` pair. The loop blocks in a single `poll(2)` and hands the
//! ready tags back to the relay context, which dispatches on the enum.

use std::os::fd::{AsFd, BorrowedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// What a ready file descriptor feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Raw ICMPv6 socket of the Router Discovery engine.
    RouterDisc,
    /// DHCPv6 UDP socket.
    Dhcpv6,
    /// NDP packet socket (BPF-filtered Neighbor Solicitations).
    NdpPacket,
    /// Netlink address/neighbor notifications.
    Netlink,
    /// Per-slave RA resend timer (index into the slave list).
    RaTimer(usize),
    /// 2-second maintenance sweep.
    Sweep,
    /// signalfd carrying termination/refresh/reap signals.
    Signal,
}

/// Consume a fired timerfd so it stops reporting readable.
pub fn drain_timer(timer: &nix::sys::timerfd::TimerFd) {
    use std::os::fd::AsRawFd;
    let mut buf = [0u8; 8];
    unsafe {
        nix::libc::read(
            timer.as_fd().as_raw_fd(),
            buf.as_mut_ptr() as *mut nix::libc::c_void,
            buf.len(),
        );
    }
}

/// Block until at least one source is ready and return their tags.
/// Interrupted waits return an empty set so the caller can re-check the
/// stop flag.
pub fn wait(sources: &[(BorrowedFd<'_>, Source)]) -> nix::Result<Vec<Source>> {
    let mut fds: Vec<PollFd> =
        sources.iter().map(|(fd, _)| PollFd::new(*fd, PollFlags::POLLIN)).collect();
    match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    }
    let ready = fds
        .iter()
        .zip(sources)
        .filter(|(pfd, _)| {
            pfd.revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP))
        })
        .map(|(_, (_, src))| *src)
        .collect();
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_reports_ready_source() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        a.write_all(b"x").unwrap();

        let sources = [(b.as_fd(), Source::Netlink)];
        let ready = wait(&sources).unwrap();
        assert_eq!(ready, vec![Source::Netlink]);
    }
}
