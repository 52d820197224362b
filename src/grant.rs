/*! The receiver-driven grant scheduler.

Every incoming message larger than its unscheduled window competes for
grants. The scheduler keeps one global queue of such messages sorted by
bytes remaining (shortest remaining processing time), selects up to
`max_overcommit` of them whenever standings change, and tops up each
selected sender that has dropped below the RTT-bytes target. Priorities
are handed out in rank order: the message closest to completion gets the
highest scheduled priority.
*/

use std::sync::{Arc, Mutex};

use crate::rpc::{RpcKey, RpcState};
use crate::socket::Socket;
use crate::stack::{ControlBody, Stack};
use crate::wire::GrantRepr;

/// Hard cap on the candidate scratch list; `max_overcommit` beyond this
/// grants no further fan-out.
const MAX_GRANT_FANOUT: usize = 16;

/// The global queue of RPCs whose incoming messages still need grants.
pub(crate) struct GrantQueue {
    inner: Mutex<GrantInner>,
}

pub(crate) struct GrantInner {
    /// Sorted by (bytes remaining, insertion sequence) ascending.
    pub entries: Vec<GrantEntry>,
    next_seq: u64,
}

pub(crate) struct GrantEntry {
    pub sock: Arc<Socket>,
    pub key: RpcKey,
    /// Cached scheduling key; refreshed by `manage_grants` each time the
    /// owning socket observes new bytes.
    pub bytes_remaining: u32,
    /// Tie-breaker: earlier insertion wins.
    pub seq: u64,
}

/// A grant decision computed under the queue lock and applied after it
/// is released.
struct Candidate {
    sock: Arc<Socket>,
    key: RpcKey,
    priority: u8,
}

impl GrantQueue {
    pub fn new() -> GrantQueue {
        GrantQueue {
            inner: Mutex::new(GrantInner {
                entries: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// Number of messages waiting for grants.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// The queue order, for invariant checks.
    #[cfg(test)]
    pub fn keys(&self) -> Vec<(RpcKey, u32)> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| (e.key, e.bytes_remaining))
            .collect()
    }
}

impl GrantInner {
    fn position(&self, sock: &Arc<Socket>, key: RpcKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.key == key && Arc::ptr_eq(&e.sock, sock))
    }

    fn upsert(&mut self, sock: &Arc<Socket>, key: RpcKey, bytes_remaining: u32) {
        match self.position(sock, key) {
            Some(i) => self.entries[i].bytes_remaining = bytes_remaining,
            None => {
                self.entries.push(GrantEntry {
                    sock: sock.clone(),
                    key,
                    bytes_remaining,
                    seq: self.next_seq,
                });
                self.next_seq += 1;
            }
        }
        // Re-sorting on each change is linear in the queue length, which
        // overcommit-driven eviction keeps short.
        self.entries
            .sort_by_key(|e| (e.bytes_remaining, e.seq));
    }

    fn remove(&mut self, sock: &Arc<Socket>, key: RpcKey) {
        if let Some(i) = self.position(sock, key) {
            self.entries.remove(i);
        }
    }
}

impl Stack {
    /// Reassess one RPC's standing after its incoming message changed,
    /// then regrant. Call with no locks held.
    pub(crate) fn manage_grants(&self, sock: &Arc<Socket>, key: RpcKey) {
        let standing = {
            let mut inner = sock.inner.lock().unwrap();
            match inner.rpc_mut(key) {
                Some(rpc) if rpc.state == RpcState::Incoming => match rpc.msgin.as_ref() {
                    Some(m) if m.scheduled && !m.complete() => {
                        rpc.possibly_in_grant_queue = true;
                        Some(m.bytes_remaining)
                    }
                    _ => None,
                },
                _ => None,
            }
        };
        let candidates = {
            let mut queue = self.grants.inner.lock().unwrap();
            match standing {
                Some(bytes_remaining) => queue.upsert(sock, key, bytes_remaining),
                None => queue.remove(sock, key),
            }
            self.select(&queue)
        };
        self.apply(candidates);
    }

    /// Regrant after an entry left the queue (completion or abort).
    pub(crate) fn rebalance_grants(&self) {
        let candidates = {
            let queue = self.grants.inner.lock().unwrap();
            self.select(&queue)
        };
        self.apply(candidates);
    }

    /// Drop an RPC from the queue, if present. Idempotent; safe to call
    /// whenever `possibly_in_grant_queue` was set.
    pub(crate) fn unlink_grant(&self, sock: &Arc<Socket>, key: RpcKey) {
        self.grants.inner.lock().unwrap().remove(sock, key);
    }

    /// Pick the top `max_overcommit` messages and assign rank-ordered
    /// priorities: the smallest remaining gets `max_sched_prio`, each
    /// rank below steps down one level, floored at `min_prio`.
    fn select(&self, queue: &GrantInner) -> heapless::Vec<Candidate, MAX_GRANT_FANOUT> {
        let budget = self.config.max_overcommit.min(MAX_GRANT_FANOUT);
        let mut out = heapless::Vec::new();
        for (rank, entry) in queue.entries.iter().take(budget).enumerate() {
            let priority = self
                .config
                .max_sched_prio
                .saturating_sub(rank as u8)
                .max(self.config.min_prio);
            if out
                .push(Candidate {
                    sock: entry.sock.clone(),
                    key: entry.key,
                    priority,
                })
                .is_err()
            {
                break;
            }
        }
        out
    }

    /// Apply grant decisions: re-validate each candidate under its
    /// socket lock, top up senders below the RTT-bytes target, and emit
    /// the GRANT packets.
    fn apply(&self, candidates: heapless::Vec<Candidate, MAX_GRANT_FANOUT>) {
        for candidate in candidates {
            let mut inner = candidate.sock.inner.lock().unwrap();
            let grant = {
                let Some(rpc) = inner.rpc_mut(candidate.key) else {
                    continue;
                };
                if rpc.state != RpcState::Incoming {
                    continue;
                }
                let Some(msgin) = rpc.msgin.as_mut() else {
                    continue;
                };
                if msgin.complete() {
                    continue;
                }
                msgin.priority = candidate.priority;
                if msgin.incoming - msgin.bytes_received() >= self.config.rtt_bytes {
                    // Enough authorized and not yet received; no grant
                    // needed now.
                    continue;
                }
                let widened = (msgin.incoming + self.config.grant_increment)
                    .min(msgin.total_length);
                if widened <= msgin.incoming {
                    continue;
                }
                msgin.incoming = widened;
                (rpc.peer.addr, rpc.dport, widened)
            };
            let (dst, dport, offset) = grant;
            let sport = inner.local_port(candidate.key);
            let repr = GrantRepr {
                offset,
                priority: candidate.priority,
            };
            self.xmit_control(
                dst,
                sport,
                dport,
                candidate.key.id(),
                ControlBody::Grant(repr),
            );
        }
    }
}
