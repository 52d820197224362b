use crate::time::Duration;
use crate::wire::{MAX_MESSAGE_SIZE, NUM_PRIORITIES};

/// Tunable parameters for a [`crate::Stack`], fixed at construction.
///
/// The defaults suit a 10 Gbit/s datacenter uplink with single-digit
/// microsecond fabric RTTs; deployments tune them the way the original
/// kernel engine is tuned through sysctl.
#[derive(Debug, Clone)]
pub struct Config {
    /// A conservative estimate of the data that can be sent over the
    /// wire in the time it takes to transmit a full-size packet and
    /// receive a grant back. The engine keeps at least this much data
    /// granted (or in flight) for every incoming message it is actively
    /// granting to. Rounded up internally to whole full-size packets.
    pub rtt_bytes: u32,

    /// Raw bandwidth of the network uplink, in units of 1e6 bits per
    /// second.
    pub link_mbps: u32,

    /// The highest priority level available to the engine.
    pub max_prio: u8,

    /// The lowest priority level available to the engine.
    pub min_prio: u8,

    /// The highest priority level available for scheduled packets;
    /// levels above this are reserved for unscheduled packets.
    pub max_sched_prio: u8,

    /// Priority assignments for incoming unscheduled packets: entry `i`
    /// is the largest message size that uses priority `i` (larger `i` is
    /// higher priority). At least one entry must cover the maximum
    /// message size; entry 0 is usually `u32::MAX`.
    pub unsched_cutoffs: [u32; NUM_PRIORITIES],

    /// Version tag advertised with `unsched_cutoffs`; bump it when the
    /// cutoffs change so peers refresh.
    pub cutoff_version: u16,

    /// Each GRANT authorizes this many additional bytes.
    pub grant_increment: u32,

    /// The maximum number of incoming messages granted to at any given
    /// point in time.
    pub max_overcommit: usize,

    /// When an RPC has seen no traffic for this many timer ticks, start
    /// sending RESENDs.
    pub resend_ticks: u32,

    /// Minimum number of timer ticks between RESENDs to the same peer.
    pub resend_interval: u32,

    /// Abort an RPC after this many RESENDs without progress.
    pub abort_resends: u32,

    /// Frames smaller than this bypass the throttle mechanism and are
    /// transmitted immediately; tiny packets are CPU-bound, not
    /// wire-bound, and queueing them through the pacer only adds
    /// overhead.
    pub throttle_min_bytes: usize,

    /// Target NIC queue occupancy as time: no frame is queued while the
    /// link-idle estimate sits more than this many nanoseconds in the
    /// future.
    pub max_nic_queue_ns: u64,

    /// Optional cap on segmentation-offload frame size, below whatever
    /// the device allows. 0 means no extra cap.
    pub max_gso_size: usize,

    /// Interval between timer ticks for the background timer worker.
    pub timer_interval: Duration,

    /// Maximum dead RPCs reaped per socket per timer tick.
    pub reap_limit: usize,

    /// Enables additional logging.
    pub verbose: bool,

    /// A collection of bits that trigger experimental behaviors; no
    /// officially defined purpose.
    pub flags: u32,

    /// Scratch values for short-term use during testing.
    pub temp: [i64; 4],
}

impl Default for Config {
    fn default() -> Config {
        let mut unsched_cutoffs = [u32::MAX; NUM_PRIORITIES];
        unsched_cutoffs[7] = 200;
        unsched_cutoffs[6] = 2_800;
        unsched_cutoffs[5] = 15_000;
        unsched_cutoffs[4] = 150_000;
        Config {
            rtt_bytes: 10_000,
            link_mbps: 10_000,
            max_prio: 7,
            min_prio: 0,
            max_sched_prio: 3,
            unsched_cutoffs,
            cutoff_version: 1,
            grant_increment: 10_000,
            max_overcommit: 8,
            resend_ticks: 5,
            resend_interval: 2,
            abort_resends: 10,
            throttle_min_bytes: 200,
            max_nic_queue_ns: 5_000,
            max_gso_size: 0,
            timer_interval: Duration::from_millis(1),
            reap_limit: 10,
            verbose: false,
            flags: 0,
            temp: [0; 4],
        }
    }
}

impl Config {
    /// Nanoseconds needed to put 1000 bytes on the uplink, inflated by
    /// five percent so the NIC queue estimate errs toward overestimating
    /// occupancy rather than overfilling the queue.
    pub(crate) fn ns_per_kbyte(&self) -> u64 {
        (8_000_000u64 * 105 / 100) / self.link_mbps.max(1) as u64
    }

    /// Check that the cutoff table can classify every legal message.
    pub(crate) fn validate(&self) {
        assert!(
            self.unsched_cutoffs.iter().any(|&c| c >= MAX_MESSAGE_SIZE),
            "unscheduled cutoffs must cover the maximum message size"
        );
        assert!(self.max_prio >= self.max_sched_prio);
        assert!(self.max_sched_prio >= self.min_prio);
    }
}
