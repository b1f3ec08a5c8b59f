//! IA bindings: the per-interface lease table and its allocators.
//!
//! Bindings live in one vector per slave interface, kept sorted by assigned
//! value. Assigned values count /64 blocks for delegated prefixes and
//! interface-identifier suffixes for addresses; the exclusive `border`
//! (derived from the narrowest on-link prefix) caps the delegable range.
//! The insert path enforces the invariants — no overlapping IA_PD ranges,
//! nothing at or past the border — so no caller can splice the list into an
//! inconsistent state.

use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::Command;

use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::{debug, warn};

/// Protocol ceiling for a client DUID.
pub const MAX_DUID_LEN: usize = 130;

/// How long a declined address stays reserved.
pub const DECLINE_RESERVE_SECS: u64 = 3600;

/// Reconfigure retransmissions stop after this many sends.
pub const RECONF_MAX_ATTEMPTS: u8 = 8;

/// One server-side lease.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Client DUID; emptied by DECLINE to keep the slot reserved but
    /// unmatchable.
    pub client_id: Vec<u8>,
    pub iaid: u32,
    /// 128 for an address (IA_NA), ≤64 for a delegated prefix (IA_PD).
    pub length: u8,
    pub assigned: u64,
    pub peer: Ipv6Addr,
    /// 0 marks a provisional (SOLICIT-only) or released binding.
    pub valid_until: u64,
    pub hostname: Option<String>,
    pub accept_reconf: bool,
    pub reconf_key: [u8; 16],
    pub reconf_attempts: u8,
    /// Next reconfigure transmission deadline; 0 = idle.
    pub reconf_due: u64,
}

impl Binding {
    pub fn new(client_id: &[u8], iaid: u32, length: u8, assigned: u64, peer: Ipv6Addr) -> Self {
        Self {
            client_id: client_id[..client_id.len().min(MAX_DUID_LEN)].to_vec(),
            iaid,
            length,
            assigned,
            peer,
            valid_until: 0,
            hostname: None,
            accept_reconf: false,
            reconf_key: [0; 16],
            reconf_attempts: 0,
            reconf_due: 0,
        }
    }

    pub fn is_pd(&self) -> bool {
        self.length <= 64
    }

    /// Number of /64 blocks covered (1 for an address binding).
    pub fn size(&self) -> u64 {
        if self.is_pd() { 1u64 << (64 - self.length) } else { 1 }
    }

    pub fn end(&self) -> u64 {
        self.assigned + self.size()
    }

    pub fn declined(&self) -> bool {
        self.client_id.is_empty()
    }
}

/// Simple rolling checksum of a DUID, the seed for IA_NA suffix picking.
pub fn duid_checksum(duid: &[u8]) -> u32 {
    duid.iter().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)))
}

/// Sorted-by-assigned lease table for one slave interface.
#[derive(Debug, Default)]
pub struct BindingSet {
    entries: Vec<Binding>,
    /// Exclusive end of the delegable range, in /64 blocks.
    border: u64,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn border(&self) -> u64 {
        self.border
    }

    pub fn set_border(&mut self, border: u64) {
        self.border = border;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Binding> {
        self.entries.iter_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&Binding> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Binding> {
        self.entries.get_mut(idx)
    }

    pub fn find(&self, client_id: &[u8], iaid: u32, pd: bool) -> Option<usize> {
        self.entries.iter().position(|b| {
            !b.declined() && b.client_id == client_id && b.iaid == iaid && b.is_pd() == pd
        })
    }

    pub fn find_na_by_suffix(&self, suffix: u64) -> Option<usize> {
        self.entries.iter().position(|b| !b.is_pd() && b.assigned == suffix)
    }

    /// Insert preserving sort order. Rejects IA_PD entries that overlap an
    /// existing range or reach past the border, and IA_NA entries whose
    /// suffix is already taken.
    pub fn insert(&mut self, binding: Binding) -> bool {
        if binding.is_pd() {
            if binding.end() > self.border {
                return false;
            }
            let overlaps = self
                .entries
                .iter()
                .any(|b| b.is_pd() && binding.assigned < b.end() && b.assigned < binding.end());
            if overlaps {
                return false;
            }
        } else if self.find_na_by_suffix(binding.assigned).is_some() {
            return false;
        }
        let pos = self.entries.partition_point(|b| b.assigned < binding.assigned);
        self.entries.insert(pos, binding);
        true
    }

    pub fn remove(&mut self, idx: usize) -> Binding {
        self.entries.remove(idx)
    }

    /// First-fit prefix allocation. The client's hint (an aligned block
    /// candidate) is tried first, then the ordered gap scan.
    pub fn assign_pd(&mut self, length: u8, hint: Option<u64>) -> Option<u64> {
        if !(1..=64).contains(&length) {
            return None;
        }
        let size = 1u64 << (64 - length);
        if let Some(h) = hint {
            let candidate = h & !(size - 1);
            if candidate + size <= self.border && self.pd_range_free(candidate, size) {
                return Some(candidate);
            }
        }
        let mut current = 0u64;
        for b in self.entries.iter().filter(|b| b.is_pd()) {
            let aligned = align_up(current, size);
            if aligned + size <= b.assigned {
                return Some(aligned);
            }
            current = current.max(b.end());
        }
        let aligned = align_up(current, size);
        if aligned + size <= self.border { Some(aligned) } else { None }
    }

    fn pd_range_free(&self, start: u64, size: u64) -> bool {
        !self
            .entries
            .iter()
            .any(|b| b.is_pd() && start < b.end() && b.assigned < start + size)
    }

    /// Pseudo-random address-suffix allocation seeded from the DUID
    /// checksum, bounded to a small suffix window, up to 100 tries.
    pub fn assign_na(&mut self, client_id: &[u8]) -> Option<u64> {
        let mut state = duid_checksum(client_id);
        for _ in 0..100 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let candidate = u64::from(state % 0x0fff);
            if candidate < 0x100 {
                continue;
            }
            if self.find_na_by_suffix(candidate).is_none() {
                return Some(candidate);
            }
        }
        None
    }

    /// Drop provisional bindings to make room; returns whether anything
    /// was reclaimed.
    pub fn reclaim_provisional(&mut self) -> bool {
        let before = self.entries.len();
        self.entries.retain(|b| b.valid_until != 0 || b.declined());
        before != self.entries.len()
    }

    /// Remove expired bindings, returning them for route/lease cleanup.
    pub fn sweep_expired(&mut self, now: u64) -> Vec<Binding> {
        let mut removed = Vec::new();
        self.entries.retain(|b| {
            if b.valid_until > 0 && b.valid_until <= now {
                removed.push(b.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let pd: Vec<&Binding> = self.entries.iter().filter(|b| b.is_pd()).collect();
        for pair in pd.windows(2) {
            assert!(pair[0].end() <= pair[1].assigned, "overlapping IA_PD ranges");
        }
        for b in &pd {
            assert!(b.end() <= self.border, "IA_PD range past border");
        }
    }
}

fn align_up(v: u64, size: u64) -> u64 {
    v.div_ceil(size) * size
}

/// One lease-file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub ifname: String,
    pub duid: Vec<u8>,
    pub iaid: u32,
    pub hostname: Option<String>,
    pub remaining: u64,
    pub assigned: u64,
    pub length: u8,
    pub addrs: Vec<(Ipv6Addr, u8)>,
}

impl LeaseRecord {
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "# {} {} {:x} {} {} {:x} {}",
            self.ifname,
            hex::encode(&self.duid),
            self.iaid,
            self.hostname.as_deref().unwrap_or("-"),
            self.remaining,
            self.assigned,
            self.length,
        );
        for (addr, len) in &self.addrs {
            line.push_str(&format!(" {addr}/{len}"));
        }
        line
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut f = line.split_whitespace();
        if f.next() != Some("#") {
            return None;
        }
        let ifname = f.next()?.to_string();
        let duid = hex::decode(f.next()?).ok()?;
        let iaid = u32::from_str_radix(f.next()?, 16).ok()?;
        let hostname = match f.next()? {
            "-" => None,
            h => Some(h.to_string()),
        };
        let remaining = f.next()?.parse().ok()?;
        let assigned = u64::from_str_radix(f.next()?, 16).ok()?;
        let length = f.next()?.parse().ok()?;
        let mut addrs = Vec::new();
        for part in f {
            let (addr, len) = part.split_once('/')?;
            addrs.push((addr.parse().ok()?, len.parse().ok()?));
        }
        Some(Self { ifname, duid, iaid, hostname, remaining, assigned, length, addrs })
    }
}

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease file io: {0}")]
    Io(#[from] io::Error),
    #[error("lease file lock: {0}")]
    Lock(nix::errno::Errno),
}

/// The flock-protected lease file plus the fire-and-forget update callback.
#[derive(Debug)]
pub struct LeaseStore {
    pub path: PathBuf,
    pub callback: Option<PathBuf>,
}

impl LeaseStore {
    pub fn new(path: PathBuf, callback: Option<PathBuf>) -> Self {
        Self { path, callback }
    }

    /// Serialize the full binding state and kick the callback program. The
    /// child is reaped by the SIGCHLD path of the event loop.
    pub fn write(&self, records: &[LeaseRecord]) -> Result<(), LeaseStoreError> {
        let file = OpenOptions::new().create(true).write(true).open(&self.path)?;
        let lock =
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| LeaseStoreError::Lock(e))?;
        lock.set_len(0)?;
        let mut out = String::new();
        for r in records {
            out.push_str(&r.to_line());
            out.push('\n');
            // Companion hostname mapping for address bindings.
            if let (Some(host), false) = (&r.hostname, r.length <= 64) {
                for (addr, _) in &r.addrs {
                    out.push_str(&format!("{addr} {host}\n"));
                }
            }
        }
        (&*lock).write_all(out.as_bytes())?;
        drop(lock);

        if let Some(cb) = &self.callback {
            match Command::new(cb).spawn() {
                Ok(child) => debug!(pid = child.id(), "spawned lease callback"),
                Err(e) => warn!(callback = %cb.display(), error = %e, "lease callback failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUID: &[u8] = &[0, 1, 0, 1, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const PEER: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2);

    fn pd(client: &[u8], iaid: u32, length: u8, assigned: u64) -> Binding {
        Binding::new(client, iaid, length, assigned, PEER)
    }

    #[test]
    fn test_first_fit_skips_occupied_head() {
        // Border 16 (a /60), one /62 at block 0: the next fit is block 4,
        // not the border.
        let mut set = BindingSet::new();
        set.set_border(16);
        assert!(set.insert(pd(DUID, 1, 62, 0)));
        assert_eq!(set.assign_pd(64, None), Some(4));
        assert!(set.insert(pd(&DUID[1..], 2, 64, 4)));
        set.assert_invariants();
    }

    #[test]
    fn test_first_fit_alignment() {
        let mut set = BindingSet::new();
        set.set_border(16);
        assert!(set.insert(pd(DUID, 1, 64, 0)));
        // A /62 cannot start at block 1; it must align to block 4.
        assert_eq!(set.assign_pd(62, None), Some(4));
    }

    #[test]
    fn test_hint_honored_and_checked() {
        let mut set = BindingSet::new();
        set.set_border(16);
        assert_eq!(set.assign_pd(62, Some(8)), Some(8));
        assert!(set.insert(pd(DUID, 1, 62, 8)));
        // Hinting into the occupied range falls back to first fit.
        assert_eq!(set.assign_pd(62, Some(9)), Some(0));
    }

    #[test]
    fn test_exhaustion_and_border() {
        let mut set = BindingSet::new();
        set.set_border(4);
        assert!(set.insert(pd(DUID, 1, 62, 0)));
        assert_eq!(set.assign_pd(64, None), None);
        // Inserting past the border is rejected by the collection itself.
        assert!(!set.insert(pd(&DUID[1..], 2, 64, 4)));
        set.assert_invariants();
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let mut set = BindingSet::new();
        set.set_border(16);
        assert!(set.insert(pd(DUID, 1, 62, 0)));
        assert!(!set.insert(pd(&DUID[1..], 2, 63, 2)));
        set.assert_invariants();
    }

    #[test]
    fn test_na_allocation_deterministic_and_collision_free() {
        let mut set = BindingSet::new();
        set.set_border(1);
        let first = set.assign_na(DUID).unwrap();
        assert!((0x100..0xfff).contains(&first));
        // Same DUID, nothing inserted: same answer.
        assert_eq!(set.assign_na(DUID), Some(first));

        let mut b = pd(DUID, 1, 128, first);
        b.valid_until = 100;
        assert!(set.insert(b));
        let second = set.assign_na(DUID).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn test_na_suffix_space_independent_of_pd_blocks() {
        // A /60 border of 16 must not collide with address suffixes ≥0x100.
        let mut set = BindingSet::new();
        set.set_border(16);
        let suffix = set.assign_na(DUID).unwrap();
        let mut b = pd(DUID, 1, 128, suffix);
        b.valid_until = 100;
        assert!(set.insert(b));
        assert_eq!(set.assign_pd(62, None), Some(0));
    }

    #[test]
    fn test_sweep_and_reclaim() {
        let mut set = BindingSet::new();
        set.set_border(16);
        let mut committed = pd(DUID, 1, 62, 0);
        committed.valid_until = 50;
        assert!(set.insert(committed));
        let provisional = pd(&DUID[1..], 2, 62, 4);
        assert!(set.insert(provisional));

        // The committed one expires, the provisional survives the sweep.
        let removed = set.sweep_expired(100);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].iaid, 1);
        assert_eq!(set.len(), 1);

        assert!(set.reclaim_provisional());
        assert!(set.is_empty());
    }

    #[test]
    fn test_lease_record_roundtrip() {
        let rec = LeaseRecord {
            ifname: "lan0".into(),
            duid: DUID.to_vec(),
            iaid: 0xdead,
            hostname: Some("host1".into()),
            remaining: 3599,
            assigned: 0x4,
            length: 62,
            addrs: vec![("2001:db8:0:14::".parse().unwrap(), 62)],
        };
        let parsed = LeaseRecord::parse_line(&rec.to_line()).unwrap();
        assert_eq!(parsed, rec);

        let rec = LeaseRecord { hostname: None, ..rec };
        assert_eq!(LeaseRecord::parse_line(&rec.to_line()).unwrap(), rec);
        assert_eq!(LeaseRecord::parse_line("2001:db8::1 host1"), None);
    }

    #[test]
    fn test_lease_store_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        let store = LeaseStore::new(path.clone(), None);
        let rec = LeaseRecord {
            ifname: "lan0".into(),
            duid: DUID.to_vec(),
            iaid: 1,
            hostname: Some("pc".into()),
            remaining: 600,
            assigned: 0x123,
            length: 128,
            addrs: vec![("2001:db8::123".parse().unwrap(), 128)],
        };
        store.write(std::slice::from_ref(&rec)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(LeaseRecord::parse_line(lines.next().unwrap()).unwrap(), rec);
        assert_eq!(lines.next(), Some("2001:db8::123 pc"));
    }
}
