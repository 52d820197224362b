use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::metrics::{inc_metric, Metrics};
use crate::time::Instant;
use crate::wire::NUM_PRIORITIES;

/// State kept about one distant host that this machine has communicated
/// with, as client or server.
///
/// Peers are shared by every RPC aimed at the host, across sockets and
/// across threads, so the mutable pieces are atomics rather than fields
/// behind a lock. None of them need cross-field consistency: the cutoffs
/// are advisory priorities and the tick/timestamp fields are
/// rate-limiter state.
pub struct Peer {
    /// IPv4 address of the host.
    pub addr: Ipv4Addr,

    /// Priorities to use for unscheduled packets sent to this host, as
    /// specified in the most recent CUTOFFS packet from it; until one
    /// arrives, the local defaults.
    unsched_cutoffs: [AtomicU32; NUM_PRIORITIES],

    /// Version from the most recent CUTOFFS packet received from this
    /// peer; echoed in DATA packets so the peer can detect staleness.
    /// 0 means no CUTOFFS packet has arrived yet.
    cutoff_version: AtomicU16,

    /// When we last sent this peer a CUTOFFS advertisement, in
    /// nanoseconds since the clock epoch; rate-limits re-advertisement.
    last_cutoffs_sent: AtomicU64,

    /// Timer tick of the most recent RESEND to this peer; spaces
    /// successive RESENDs out.
    last_resend_tick: AtomicU32,
}

impl Peer {
    fn new(addr: Ipv4Addr, default_cutoffs: &[u32; NUM_PRIORITIES]) -> Peer {
        const ZERO32: AtomicU32 = AtomicU32::new(0);
        let unsched_cutoffs = [ZERO32; NUM_PRIORITIES];
        for (slot, value) in unsched_cutoffs.iter().zip(default_cutoffs) {
            slot.store(*value, Ordering::Relaxed);
        }
        Peer {
            addr,
            unsched_cutoffs,
            cutoff_version: AtomicU16::new(0),
            last_cutoffs_sent: AtomicU64::new(0),
            last_resend_tick: AtomicU32::new(0),
        }
    }

    /// Replace the advertised cutoffs and their version.
    pub fn set_cutoffs(&self, cutoffs: &[u32; NUM_PRIORITIES], version: u16) {
        for (slot, value) in self.unsched_cutoffs.iter().zip(cutoffs) {
            slot.store(*value, Ordering::Relaxed);
        }
        self.cutoff_version.store(version, Ordering::Relaxed);
    }

    /// The cutoff version to echo in DATA packets sent to this peer.
    pub fn cutoff_version(&self) -> u16 {
        self.cutoff_version.load(Ordering::Relaxed)
    }

    /// Pick the priority for unscheduled packets of a message of
    /// `length` bytes: the highest level whose cutoff admits the
    /// message. Entry 0 covers the maximum message size, so the scan
    /// always terminates with a valid level.
    pub fn unsched_priority(&self, max_prio: u8, length: u32) -> u8 {
        let mut level = max_prio as usize;
        loop {
            if self.unsched_cutoffs[level].load(Ordering::Relaxed) >= length {
                return level as u8;
            }
            if level == 0 {
                return 0;
            }
            level -= 1;
        }
    }

    /// The first priority-cutoff boundary at or above `length`: the
    /// smallest advertised cutoff that admits a message of that size.
    /// Sizes the unscheduled window of short outgoing messages so the
    /// whole message rides in one unscheduled priority class. Entry 0
    /// covers the maximum message size, so a boundary always exists.
    pub fn unsched_boundary(&self, length: u32) -> u32 {
        let mut boundary = u32::MAX;
        for cutoff in &self.unsched_cutoffs {
            let cutoff = cutoff.load(Ordering::Relaxed);
            if cutoff >= length && cutoff < boundary {
                boundary = cutoff;
            }
        }
        boundary
    }

    /// True if a CUTOFFS advertisement may be sent now; updates the
    /// rate-limiter timestamp when it returns true.
    pub fn may_send_cutoffs(&self, now: Instant, min_gap_nanos: u64) -> bool {
        let last = self.last_cutoffs_sent.load(Ordering::Relaxed);
        let now = now.total_nanos();
        if last != 0 && now.saturating_sub(last) < min_gap_nanos {
            return false;
        }
        self.last_cutoffs_sent
            .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// True if a RESEND may go to this peer on tick `tick`, given the
    /// minimum spacing; updates the last-resend tick when it returns
    /// true.
    pub fn may_send_resend(&self, tick: u32, interval: u32) -> bool {
        let last = self.last_resend_tick.load(Ordering::Relaxed);
        if last != 0 && tick.wrapping_sub(last) < interval {
            return false;
        }
        self.last_resend_tick
            .compare_exchange(last, tick.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Maps IPv4 addresses to [`Peer`] records.
///
/// Entries are added gradually and never removed: lookups hand out
/// `Arc<Peer>` handles that callers may retain indefinitely, so the
/// table only grows (one entry per distinct host ever contacted).
/// Lookups take a brief read lock; only insertion of a new peer takes
/// the write half.
pub struct PeerTable {
    peers: RwLock<HashMap<Ipv4Addr, Arc<Peer>>>,
    default_cutoffs: [u32; NUM_PRIORITIES],
}

impl PeerTable {
    pub fn new(default_cutoffs: [u32; NUM_PRIORITIES]) -> PeerTable {
        PeerTable {
            peers: RwLock::new(HashMap::new()),
            default_cutoffs,
        }
    }

    /// Return the peer for `addr`, creating it on first contact.
    pub fn find(&self, addr: Ipv4Addr, metrics: &Metrics) -> Arc<Peer> {
        inc_metric!(metrics, peer_hash_links);
        if let Some(peer) = self.peers.read().unwrap().get(&addr) {
            return peer.clone();
        }
        let mut peers = self.peers.write().unwrap();
        // Someone else may have inserted while we waited for the write
        // lock.
        if let Some(peer) = peers.get(&addr) {
            return peer.clone();
        }
        inc_metric!(metrics, peer_new_entries);
        let peer = Arc::new(Peer::new(addr, &self.default_cutoffs));
        peers.insert(addr, peer.clone());
        peer
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn cutoffs() -> [u32; NUM_PRIORITIES] {
        let mut c = [u32::MAX; NUM_PRIORITIES];
        c[7] = 200;
        c[6] = 2_800;
        c[5] = 15_000;
        c[4] = 150_000;
        c
    }

    #[test]
    fn lookups_share_one_entry() {
        let metrics = Metrics::new();
        let table = PeerTable::new(cutoffs());
        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let a = table.find(addr, &metrics);
        let b = table.find(addr, &metrics);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(metrics.cell().peer_new_entries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsched_priority_tracks_size() {
        let metrics = Metrics::new();
        let table = PeerTable::new(cutoffs());
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 9), &metrics);
        assert_eq!(peer.unsched_priority(7, 100), 7);
        assert_eq!(peer.unsched_priority(7, 500), 6);
        assert_eq!(peer.unsched_priority(7, 10_000), 5);
        assert_eq!(peer.unsched_priority(7, 100_000), 4);
        assert_eq!(peer.unsched_priority(7, 1_000_000), 3);
    }

    #[test]
    fn boundary_is_first_cutoff_at_or_above_length() {
        let metrics = Metrics::new();
        let table = PeerTable::new(cutoffs());
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 8), &metrics);
        assert_eq!(peer.unsched_boundary(100), 200);
        assert_eq!(peer.unsched_boundary(200), 200);
        assert_eq!(peer.unsched_boundary(500), 2_800);
        assert_eq!(peer.unsched_boundary(20_000), 150_000);
        // Beyond every finite cutoff only the sentinel entry remains.
        assert_eq!(peer.unsched_boundary(500_000), u32::MAX);
    }

    #[test]
    fn cutoffs_update_applies() {
        let metrics = Metrics::new();
        let table = PeerTable::new(cutoffs());
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 1), &metrics);
        assert_eq!(peer.cutoff_version(), 0);
        let mut advertised = [u32::MAX; NUM_PRIORITIES];
        advertised[7] = 1_000_000;
        peer.set_cutoffs(&advertised, 42);
        assert_eq!(peer.cutoff_version(), 42);
        assert_eq!(peer.unsched_priority(7, 500_000), 7);
    }

    #[test]
    fn resend_spacing() {
        let metrics = Metrics::new();
        let table = PeerTable::new(cutoffs());
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 2), &metrics);
        assert!(peer.may_send_resend(10, 2));
        assert!(!peer.may_send_resend(11, 2));
        assert!(peer.may_send_resend(12, 2));
    }
}
