//! Kernel-facing plumbing: sockets, netlink, procfs.

pub mod netlink;
pub mod procnet;
pub mod sockets;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch; the single clock all lease and cache
/// timestamps are expressed in.
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
