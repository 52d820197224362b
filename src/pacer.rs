/*! The output pacer.

The engine refuses to queue a frame at the NIC while the link-idle-time
estimate (the moment all previously queued bytes will have left the
wire) sits more than `max_nic_queue_ns` in the future. Refused frames
park their RPC on the throttle queue, and a dedicated worker drains it
as the estimate decays. An opportunistic hook lets any thread run one
drain pass inline when it notices throttled work and slack occupancy,
so a descheduled worker cannot stall output; a compare-and-swap guard
with zero-wait fallback keeps the drain single-threaded.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::metrics::inc_metric;
use crate::outgoing::XmitResult;
use crate::rpc::RpcKey;
use crate::socket::Socket;
use crate::stack::Stack;
use crate::time::Instant;
use crate::wire::{ETH_OVERHEAD, IPV4_HEADER_LEN};

/// The throttle queue and the shared NIC occupancy estimate.
pub(crate) struct Throttle {
    /// RPCs with transmittable frames the occupancy ceiling refused,
    /// oldest first.
    queue: Mutex<VecDeque<(Arc<Socket>, RpcKey)>>,

    /// Wakes the pacer worker when the queue gains an entry.
    kick: Condvar,

    /// Mirror of `queue.len()`, readable without the lock so the
    /// fast-path hook can bail out cheaply.
    queued: AtomicUsize,

    /// 1 while a drain pass is running; contenders return immediately.
    pacer_active: AtomicBool,

    /// The estimated time, in nanoseconds on the engine clock, at which
    /// every byte handed to the device will have left the wire. May be
    /// in the past. The estimate assumes this engine is the only
    /// transmitter on the uplink.
    pub link_idle_time: AtomicU64,
}

impl Throttle {
    pub fn new() -> Throttle {
        Throttle {
            queue: Mutex::new(VecDeque::new()),
            kick: Condvar::new(),
            queued: AtomicUsize::new(0),
            pacer_active: AtomicBool::new(false),
            link_idle_time: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Stack {
    /// Account one frame of `wire_len` transport bytes against the NIC
    /// occupancy estimate. Returns false (and charges nothing) if
    /// queueing it would push the estimate past the ceiling; `force`
    /// suppresses the refusal but still charges.
    pub(crate) fn check_nic_queue(&self, wire_len: usize, now: Instant, force: bool) -> bool {
        let bytes = (wire_len + IPV4_HEADER_LEN + ETH_OVERHEAD) as u64;
        let wire_ns = bytes * self.ns_per_kbyte / 1000;
        let now = now.total_nanos();
        loop {
            let idle = self.throttle.link_idle_time.load(Ordering::Acquire);
            let new_idle = idle.max(now) + wire_ns;
            if !force && new_idle - now > self.config.max_nic_queue_ns {
                return false;
            }
            if self
                .throttle
                .link_idle_time
                .compare_exchange(idle, new_idle, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Append an RPC to the throttle queue. The caller holds the owning
    /// socket's lock and has set the RPC's throttled flag.
    pub(crate) fn add_to_throttled(&self, sock: &Arc<Socket>, key: RpcKey) {
        let mut queue = self.throttle.queue.lock().unwrap();
        if !queue
            .iter()
            .any(|(s, k)| *k == key && Arc::ptr_eq(s, sock))
        {
            queue.push_back((sock.clone(), key));
            self.throttle.queued.store(queue.len(), Ordering::Release);
        }
        self.throttle.kick.notify_one();
    }

    /// Remove an RPC from the throttle queue, if present. Idempotent.
    pub(crate) fn unlink_throttle(&self, sock: &Arc<Socket>, key: RpcKey) {
        let mut queue = self.throttle.queue.lock().unwrap();
        queue.retain(|(s, k)| !(*k == key && Arc::ptr_eq(s, sock)));
        self.throttle.queued.store(queue.len(), Ordering::Release);
    }

    /// Fast-path hook: run a drain pass inline if throttled work exists
    /// and the NIC has slack. Call with no locks held.
    pub(crate) fn check_pacer(&self, now: Instant) {
        if self.throttle.queued.load(Ordering::Acquire) == 0 {
            return;
        }
        if now.total_nanos() + self.config.max_nic_queue_ns
            < self.throttle.link_idle_time.load(Ordering::Acquire)
        {
            return;
        }
        self.pacer_xmit();
    }

    /// One drain pass: transmit frames from the head of the throttle
    /// queue until it empties or the occupancy ceiling is reached. At
    /// most one pass runs at a time; contenders return immediately.
    pub fn pacer_xmit(&self) {
        if self
            .throttle
            .pacer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let start = Instant::now();
        loop {
            let now = Instant::now().total_nanos();
            let idle = self.throttle.link_idle_time.load(Ordering::Acquire);
            if idle > now && idle - now >= self.config.max_nic_queue_ns {
                break;
            }
            let head = self.throttle.queue.lock().unwrap().front().cloned();
            let Some((sock, key)) = head else {
                break;
            };
            if idle < now {
                // The link drained dry with work still waiting: output
                // bandwidth nobody can get back.
                inc_metric!(self.metrics, pacer_lost_cycles, now - idle);
            }
            let mut inner = sock.inner.lock().unwrap();
            if !matches!(inner.rpc(key), Some(rpc) if rpc.throttled) {
                drop(inner);
                self.unlink_throttle(&sock, key);
                continue;
            }
            let result = self.xmit_data(&sock, &mut inner, key, true);
            if result == XmitResult::Throttled {
                // The forced frame went out but the next one saturated
                // the queue again; leave the RPC at the head.
                break;
            }
            if let Some(rpc) = inner.rpc_mut(key) {
                rpc.throttled = false;
            }
            self.unlink_throttle(&sock, key);
            self.finish_response(&sock, &mut inner, key, result);
        }
        self.throttle.pacer_active.store(false, Ordering::Release);
        inc_metric!(
            self.metrics,
            pacer_cycles,
            Instant::now().total_nanos() - start.total_nanos()
        );
    }

    /// Body of the pacer worker thread: sleep while the throttle queue
    /// is empty or the NIC is saturated, drain otherwise.
    pub(crate) fn pacer_main(&self) {
        while !self.exit.load(Ordering::Acquire) {
            {
                let queue = self.throttle.queue.lock().unwrap();
                if queue.is_empty() {
                    let _unused = self
                        .throttle
                        .kick
                        .wait_timeout(queue, std::time::Duration::from_millis(1))
                        .unwrap();
                    continue;
                }
            }
            let now = Instant::now().total_nanos();
            let idle = self.throttle.link_idle_time.load(Ordering::Acquire);
            if idle > now + self.config.max_nic_queue_ns {
                // Sleep off the excess occupancy, but wake at least once
                // a millisecond to notice shutdown.
                let excess = (idle - now - self.config.max_nic_queue_ns).min(1_000_000);
                std::thread::sleep(std::time::Duration::from_nanos(excess));
            }
            self.pacer_xmit();
        }
    }
}
