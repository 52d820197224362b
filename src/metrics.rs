/*! Free-running performance counters.

One [`MetricsCell`] exists per logical core, so the hot paths can bump
counters without locks or cross-core cache traffic. A thread indexes its
own cell through `sched_getcpu`; if it migrates mid-update the increment
lands in a neighboring cell, which is harmless because readers only ever
look at the sum.

All counters are free-running: they never reset. [`Metrics::compile`]
serializes the summed snapshot into a human-readable text blob.
*/

use core::fmt::Write;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::wire::PacketType;

/// Entry `i` covers received messages of `64*i..64*i+63` bytes.
pub const NUM_SMALL_BUCKETS: usize = 64;

/// Entry `i` covers received messages of `1024*i..1024*i+1023` bytes;
/// the first four entries stay zero (the small buckets cover them).
pub const NUM_MEDIUM_BUCKETS: usize = 64;

const ZERO: AtomicU64 = AtomicU64::new(0);

/// Counters for one logical core.
pub struct MetricsCell {
    /// Total bytes received in messages small enough for the 64-byte
    /// buckets.
    pub small_msg_bytes: [AtomicU64; NUM_SMALL_BUCKETS],
    /// Total bytes received in messages small enough for the 1 KiB
    /// buckets.
    pub medium_msg_bytes: [AtomicU64; NUM_MEDIUM_BUCKETS],
    /// Total bytes received in messages too large for either bucket set.
    pub large_msg_bytes: AtomicU64,
    /// Packets sent, per packet type (entry 0 is DATA, and so on).
    pub packets_sent: [AtomicU64; PacketType::COUNT],
    /// Packets received, per packet type.
    pub packets_received: [AtomicU64; PacketType::COUNT],
    /// Complete request messages received.
    pub requests_received: AtomicU64,
    /// Complete response messages received.
    pub responses_received: AtomicU64,
    /// Calls into the packet receive path (each call may carry several
    /// coalesced wire packets).
    pub pkt_recv_calls: AtomicU64,
    /// Total nanoseconds spent in the timer.
    pub timer_cycles: AtomicU64,
    /// Total nanoseconds spent transmitting in the pacer.
    pub pacer_cycles: AtomicU64,
    /// Wasted output bandwidth, in nanoseconds the link sat idle with
    /// throttled traffic waiting, because the pacer was slow or got
    /// descheduled.
    pub pacer_lost_cycles: AtomicU64,
    /// Data packets issued in response to RESENDs.
    pub resent_packets: AtomicU64,
    /// Link traversals in peer-table lookups.
    pub peer_hash_links: AtomicU64,
    /// New entries created in the peer table.
    pub peer_new_entries: AtomicU64,
    /// Receive-path allocation failures.
    pub alloc_errors: AtomicU64,
    /// Sends that failed because no route to the peer existed.
    pub route_errors: AtomicU64,
    /// Transmit failures for control packets.
    pub control_xmit_errors: AtomicU64,
    /// Transmit failures for data packets.
    pub data_xmit_errors: AtomicU64,
    /// Incoming packets discarded because they referred to a nonexistent
    /// RPC.
    pub unknown_rpcs: AtomicU64,
    /// Incoming packets discarded because a server RPC could not be
    /// created.
    pub server_cant_create_rpcs: AtomicU64,
    /// Packets discarded because of an unsupported type octet.
    pub unknown_packet_types: AtomicU64,
    /// Packets discarded because they were too short for their type.
    pub short_packets: AtomicU64,
    /// Client RPCs aborted by timeout.
    pub client_rpc_timeouts: AtomicU64,
    /// Server RPCs aborted by timeout.
    pub server_rpc_timeouts: AtomicU64,
    /// Reserved for temporary use during testing.
    pub temp: [AtomicU64; 4],
}

impl MetricsCell {
    const fn new() -> MetricsCell {
        MetricsCell {
            small_msg_bytes: [ZERO; NUM_SMALL_BUCKETS],
            medium_msg_bytes: [ZERO; NUM_MEDIUM_BUCKETS],
            large_msg_bytes: ZERO,
            packets_sent: [ZERO; PacketType::COUNT],
            packets_received: [ZERO; PacketType::COUNT],
            requests_received: ZERO,
            responses_received: ZERO,
            pkt_recv_calls: ZERO,
            timer_cycles: ZERO,
            pacer_cycles: ZERO,
            pacer_lost_cycles: ZERO,
            resent_packets: ZERO,
            peer_hash_links: ZERO,
            peer_new_entries: ZERO,
            alloc_errors: ZERO,
            route_errors: ZERO,
            control_xmit_errors: ZERO,
            data_xmit_errors: ZERO,
            unknown_rpcs: ZERO,
            server_cant_create_rpcs: ZERO,
            unknown_packet_types: ZERO,
            short_packets: ZERO,
            client_rpc_timeouts: ZERO,
            server_rpc_timeouts: ZERO,
            temp: [ZERO; 4],
        }
    }

    /// Credit `length` received message bytes to the right size bucket.
    pub fn record_msg_bytes(&self, length: u32) {
        let length = length as u64;
        if length < 64 * NUM_SMALL_BUCKETS as u64 {
            self.small_msg_bytes[(length / 64) as usize].fetch_add(length, Ordering::Relaxed);
        } else if length < 1024 * NUM_MEDIUM_BUCKETS as u64 {
            self.medium_msg_bytes[(length / 1024) as usize].fetch_add(length, Ordering::Relaxed);
        } else {
            self.large_msg_bytes.fetch_add(length, Ordering::Relaxed);
        }
    }

    /// Count one sent packet of the given type.
    pub fn record_packet_sent(&self, ty: PacketType) {
        if let Some(i) = ty.metric_index() {
            self.packets_sent[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one received packet of the given type.
    pub fn record_packet_received(&self, ty: PacketType) {
        if let Some(i) = ty.metric_index() {
            self.packets_received[i].fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bump a counter in the current core's cell by one.
macro_rules! inc_metric {
    ($metrics:expr, $field:ident) => {
        $metrics.cell().$field.fetch_add(1, core::sync::atomic::Ordering::Relaxed)
    };
    ($metrics:expr, $field:ident, $count:expr) => {
        $metrics.cell().$field.fetch_add($count, core::sync::atomic::Ordering::Relaxed)
    };
}
pub(crate) use inc_metric;

/// The per-core counter records for one engine instance.
pub struct Metrics {
    cells: Vec<MetricsCell>,
}

impl Metrics {
    pub fn new() -> Metrics {
        let cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        let cores = if cores < 1 { 1 } else { cores as usize };
        let mut cells = Vec::with_capacity(cores);
        for _ in 0..cores {
            cells.push(MetricsCell::new());
        }
        Metrics { cells }
    }

    /// The cell for the core this thread is currently executing on.
    pub fn cell(&self) -> &MetricsCell {
        let cpu = unsafe { libc::sched_getcpu() };
        let index = if cpu < 0 { 0 } else { cpu as usize };
        &self.cells[index % self.cells.len()]
    }

    fn sum(&self, get: impl Fn(&MetricsCell) -> &AtomicU64) -> u64 {
        self.cells
            .iter()
            .map(|c| get(c).load(Ordering::Relaxed))
            .sum()
    }

    /// Serialize the summed counters into a human-readable snapshot.
    pub fn compile(&self) -> String {
        fn line(out: &mut String, name: &str, value: u64, help: &str) {
            let _ = writeln!(out, "{name:<28} {value:>15}  {help}");
        }
        let mut out = String::new();
        for i in 0..NUM_SMALL_BUCKETS {
            let value = self.sum(|c| &c.small_msg_bytes[i]);
            if value != 0 {
                let _ = writeln!(
                    out,
                    "msg_bytes_{:<18} {value:>15}  total bytes in messages {}-{} bytes long",
                    64 * (i + 1),
                    64 * i,
                    64 * (i + 1) - 1
                );
            }
        }
        for i in 0..NUM_MEDIUM_BUCKETS {
            let value = self.sum(|c| &c.medium_msg_bytes[i]);
            if value != 0 {
                let _ = writeln!(
                    out,
                    "msg_bytes_{:<18} {value:>15}  total bytes in messages {}-{} bytes long",
                    1024 * (i + 1),
                    1024 * i,
                    1024 * (i + 1) - 1
                );
            }
        }
        line(&mut out,
            "large_msg_bytes",
            self.sum(|c| &c.large_msg_bytes),
            "total bytes in messages 64K bytes or longer",
        );
        let types = ["DATA", "GRANT", "RESEND", "RESTART", "BUSY", "CUTOFFS", "FREEZE"];
        for (i, name) in types.iter().enumerate() {
            let sent = self.sum(|c| &c.packets_sent[i]);
            let received = self.sum(|c| &c.packets_received[i]);
            let _ = writeln!(out, "packets_sent_{name:<15} {sent:>15}");
            let _ = writeln!(out, "packets_rcvd_{name:<15} {received:>15}");
        }
        line(&mut out,
            "requests_received",
            self.sum(|c| &c.requests_received),
            "incoming request messages",
        );
        line(&mut out,
            "responses_received",
            self.sum(|c| &c.responses_received),
            "incoming response messages",
        );
        line(&mut out,
            "pkt_recv_calls",
            self.sum(|c| &c.pkt_recv_calls),
            "calls into the packet receive path",
        );
        line(&mut out,
            "timer_ns",
            self.sum(|c| &c.timer_cycles),
            "time spent in the timer",
        );
        line(&mut out,
            "pacer_ns",
            self.sum(|c| &c.pacer_cycles),
            "time spent transmitting in the pacer",
        );
        line(&mut out,
            "pacer_lost_ns",
            self.sum(|c| &c.pacer_lost_cycles),
            "output bandwidth wasted waiting for the pacer",
        );
        line(&mut out,
            "resent_packets",
            self.sum(|c| &c.resent_packets),
            "data packets retransmitted after RESEND",
        );
        line(&mut out,
            "peer_hash_links",
            self.sum(|c| &c.peer_hash_links),
            "hash-chain traversals in peer lookups",
        );
        line(&mut out,
            "peer_new_entries",
            self.sum(|c| &c.peer_new_entries),
            "peer-table entries created",
        );
        line(&mut out,"alloc_errors", self.sum(|c| &c.alloc_errors), "receive-side allocation failures");
        line(&mut out,"route_errors", self.sum(|c| &c.route_errors), "sends that found no route");
        line(&mut out,
            "control_xmit_errors",
            self.sum(|c| &c.control_xmit_errors),
            "control packet transmit failures",
        );
        line(&mut out,
            "data_xmit_errors",
            self.sum(|c| &c.data_xmit_errors),
            "data packet transmit failures",
        );
        line(&mut out,
            "unknown_rpcs",
            self.sum(|c| &c.unknown_rpcs),
            "packets for nonexistent RPCs",
        );
        line(&mut out,
            "server_cant_create_rpcs",
            self.sum(|c| &c.server_cant_create_rpcs),
            "packets dropped creating a server RPC",
        );
        line(&mut out,
            "unknown_packet_types",
            self.sum(|c| &c.unknown_packet_types),
            "packets with unsupported type octets",
        );
        line(&mut out,
            "short_packets",
            self.sum(|c| &c.short_packets),
            "packets too short for their type",
        );
        line(&mut out,
            "client_rpc_timeouts",
            self.sum(|c| &c.client_rpc_timeouts),
            "client RPCs aborted by timeout",
        );
        line(&mut out,
            "server_rpc_timeouts",
            self.sum(|c| &c.server_rpc_timeouts),
            "server RPCs aborted by timeout",
        );
        for (i, _) in self.cells[0].temp.iter().enumerate() {
            let value = self.sum(|c| &c.temp[i]);
            if value != 0 {
                let _ = writeln!(out, "temp{i:<24} {value:>15}");
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_buckets() {
        let metrics = Metrics::new();
        metrics.cell().record_msg_bytes(100); // small bucket 1
        metrics.cell().record_msg_bytes(5_000); // medium bucket 4
        metrics.cell().record_msg_bytes(500_000); // large
        assert_eq!(metrics.sum(|c| &c.small_msg_bytes[1]), 100);
        assert_eq!(metrics.sum(|c| &c.medium_msg_bytes[4]), 5_000);
        assert_eq!(metrics.sum(|c| &c.large_msg_bytes), 500_000);
    }

    #[test]
    fn compile_mentions_counters() {
        let metrics = Metrics::new();
        metrics.cell().record_packet_sent(PacketType::Data);
        metrics.cell().unknown_rpcs.fetch_add(3, Ordering::Relaxed);
        let text = metrics.compile();
        assert!(text.contains("packets_sent_DATA"));
        assert!(text.contains("unknown_rpcs"));
    }
}
