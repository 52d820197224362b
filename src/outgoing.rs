/*! Construction and transmission of outgoing messages.

An outgoing message is split at construction time into offset-ordered
GSO frames, each carrying one or more wire segments with headers already
filled in. Frames survive transmission so RESENDs can replay them; only
the incoming watermark, retransmit flag, and link priority are stamped
at transmit time.
*/

use std::sync::Arc;

use crate::metrics::inc_metric;
use crate::rpc::RpcKey;
use crate::socket::{Socket, SocketInner};
use crate::stack::Stack;
use crate::time::Instant;
use crate::wire::{data, CommonPacket, DataPacket, PacketType, MAX_SEG_PAYLOAD};

/// One GSO frame of an outgoing message: a fully formed DATA buffer
/// holding `data_len` message bytes starting at `offset`.
#[derive(Debug)]
pub struct Frame {
    pub offset: u32,
    pub data_len: u32,
    pub wire: Vec<u8>,
}

impl Frame {
    /// Offset just past the message bytes this frame carries.
    pub fn end(&self) -> u32 {
        self.offset + self.data_len
    }
}

/// Describes a message (request or response) for which this machine is
/// the sender.
#[derive(Debug)]
pub struct OutMessage {
    /// Total bytes in the message (excluding headers).
    pub length: u32,

    /// All frames of the message, in offset order.
    pub frames: Vec<Frame>,

    /// Index of the next frame to transmit; all frames before it have
    /// been sent. `frames.len()` means the entire message has been sent.
    pub next_frame: usize,

    /// Initial bytes the sender may transmit without waiting for
    /// grants. May exceed `length`.
    pub unscheduled: u32,

    /// Bytes the sender is currently permitted to transmit, including
    /// the unscheduled window. Never exceeds `length`.
    pub granted: u32,

    /// Priority level for future scheduled frames; updated by GRANTs.
    pub sched_priority: u8,
}

/// Header fields shared by every frame of one outgoing message.
#[derive(Debug, Clone, Copy)]
pub struct OutMeta {
    pub sport: u16,
    pub dport: u16,
    pub id: u64,
    /// Version of the most recent CUTOFFS received from the
    /// destination, echoed so it can detect staleness.
    pub cutoff_version: u16,
}

impl OutMessage {
    /// Split `payload` into frames with headers filled in.
    ///
    /// `gso_limit` bounds the wire size of one frame (0 disables
    /// batching). The unscheduled window is sized from `rtt_bytes` for
    /// long messages and from `short_boundary` (the peer's first
    /// priority-cutoff boundary at or above the message length) for
    /// short ones.
    pub fn new(
        payload: &[u8],
        meta: OutMeta,
        rtt_bytes: u32,
        short_boundary: u32,
        gso_limit: usize,
    ) -> OutMessage {
        let length = payload.len() as u32;
        let segs_per_frame = (gso_limit / crate::wire::ETHERNET_MAX_PAYLOAD).max(1);

        let mut frames = Vec::new();
        let mut at = 0usize;
        while at < payload.len() {
            let frame_offset = at as u32;
            let mut seg_lens = heapless::Vec::<usize, 64>::new();
            let mut frame_bytes = 0usize;
            for _ in 0..segs_per_frame {
                if at + frame_bytes >= payload.len() {
                    break;
                }
                let remaining = payload.len() - at - frame_bytes;
                let seg = remaining.min(MAX_SEG_PAYLOAD);
                if seg_lens.push(seg).is_err() {
                    break;
                }
                frame_bytes += seg;
            }
            let mut wire = vec![0u8; data::buffer_len(&seg_lens)];
            let mut common = CommonPacket::new_unchecked(&mut wire[..]);
            common.set_src_port(meta.sport);
            common.set_dst_port(meta.dport);
            common.set_packet_type(PacketType::Data);
            common.set_id(meta.id);
            common.set_doff(data::DOFF);
            common.clear_unused();
            let mut packet = DataPacket::new_unchecked(&mut wire[..]);
            packet.set_message_length(length);
            packet.set_incoming(0);
            packet.set_cutoff_version(meta.cutoff_version);
            packet.set_retransmit(false);
            let mut seg_at = 0;
            for &seg in seg_lens.iter() {
                seg_at = packet.emit_segment(seg_at, at as u32, &payload[at..at + seg]);
                at += seg;
            }
            frames.push(Frame {
                offset: frame_offset,
                data_len: (at as u32) - frame_offset,
                wire,
            });
        }

        // A message that fits the RTT allotment is short: its window
        // widens to the next priority-cutoff boundary so the whole
        // message rides in one unscheduled class (and may exceed the
        // length). Longer messages get the RTT allotment rounded up to
        // whole full-size segments.
        let seg = MAX_SEG_PAYLOAD as u32;
        let rtt_window = rtt_bytes.div_ceil(seg) * seg;
        let unscheduled = if length <= rtt_window {
            short_boundary.max(length)
        } else {
            rtt_window
        };
        OutMessage {
            length,
            frames,
            next_frame: 0,
            unscheduled,
            granted: unscheduled.min(length),
            sched_priority: 0,
        }
    }

    /// Offset just past the last transmitted byte.
    pub fn sent_end(&self) -> u32 {
        if self.next_frame == 0 {
            0
        } else {
            self.frames[self.next_frame - 1].end()
        }
    }

    /// True once every frame has been transmitted at least once.
    pub fn fully_sent(&self) -> bool {
        self.next_frame >= self.frames.len()
    }

    /// Widen the granted window to `offset` (clamped to the message
    /// length), returning true if it grew.
    pub fn grant_to(&mut self, offset: u32) -> bool {
        let offset = offset.min(self.length);
        if offset > self.granted {
            self.granted = offset;
            true
        } else {
            false
        }
    }

    /// Start over from offset zero, as commanded by a RESTART.
    pub fn reset(&mut self) {
        self.next_frame = 0;
        self.granted = self.unscheduled.min(self.length);
        for frame in &mut self.frames {
            DataPacket::new_unchecked(&mut frame.wire[..]).set_retransmit(false);
        }
    }
}

/// Outcome of a transmission attempt.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum XmitResult {
    /// Every frame of the message has been transmitted.
    Complete,
    /// Transmission stopped at the granted boundary.
    GrantWait,
    /// The NIC occupancy ceiling refused a frame; the RPC is on the
    /// throttle queue.
    Throttled,
}

impl Stack {
    /// Transmit frames of `key`'s outgoing message, starting at its
    /// cursor, until the message is exhausted, the granted window
    /// closes, or the NIC occupancy ceiling intervenes. Caller holds the
    /// socket lock.
    ///
    /// `from_pacer` marks the call made by the pacer on a throttled RPC:
    /// the first frame goes out regardless of occupancy (the pacer has
    /// already waited for slack).
    pub(crate) fn xmit_data(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
        from_pacer: bool,
    ) -> XmitResult {
        let mut first = from_pacer;
        loop {
            let Some(rpc) = inner.rpc_mut(key) else {
                return XmitResult::Complete;
            };
            let Some(msgout) = rpc.msgout.as_mut() else {
                return XmitResult::Complete;
            };
            if msgout.next_frame >= msgout.frames.len() {
                return XmitResult::Complete;
            }
            let granted = msgout.granted;
            let sched_priority = msgout.sched_priority;
            let unscheduled = msgout.unscheduled;
            let length = msgout.length;
            let frame = &mut msgout.frames[msgout.next_frame];
            if frame.offset >= granted {
                return XmitResult::GrantWait;
            }

            let force = first || frame.wire.len() < self.config.throttle_min_bytes;
            if !self.check_nic_queue(frame.wire.len(), Instant::now(), force) {
                let throttled = rpc.throttled;
                if !throttled {
                    rpc.throttled = true;
                    self.add_to_throttled(sock, key);
                }
                return XmitResult::Throttled;
            }
            first = false;

            // The receiver may count on everything we have committed to
            // send without further grants, including the tail of this
            // frame when GSO batching overshoots the granted window.
            let incoming = granted.max(frame.end()).min(length);
            let mut packet = DataPacket::new_unchecked(&mut frame.wire[..]);
            packet.set_incoming(incoming);
            let priority = if frame.offset < unscheduled {
                rpc.peer.unsched_priority(self.config.max_prio, length)
            } else {
                sched_priority
            };
            let dst = rpc.peer.addr;
            if let Err(err) = self.device.transmit(dst, priority, &frame.wire) {
                net_debug!("data transmit to {dst} failed: {err}");
                inc_metric!(self.metrics, data_xmit_errors);
            } else {
                self.metrics.cell().record_packet_sent(PacketType::Data);
            }
            msgout.next_frame += 1;
        }
    }

    /// Retransmit every already-sent frame overlapping `[start, end)` at
    /// `priority`, marking it as a retransmission. Caller holds the
    /// socket lock.
    pub(crate) fn resend_data(
        &self,
        inner: &mut SocketInner,
        key: RpcKey,
        start: u32,
        end: u32,
        priority: u8,
    ) {
        let Some(rpc) = inner.rpc_mut(key) else {
            return;
        };
        let Some(msgout) = rpc.msgout.as_mut() else {
            return;
        };
        let sent = msgout.next_frame;
        let granted = msgout.granted;
        let length = msgout.length;
        for frame in msgout.frames[..sent].iter_mut() {
            if frame.end() <= start || frame.offset >= end {
                continue;
            }
            let incoming = granted.max(frame.end()).min(length);
            let mut packet = DataPacket::new_unchecked(&mut frame.wire[..]);
            packet.set_retransmit(true);
            packet.set_incoming(incoming);
            if let Err(err) = self.device.transmit(rpc.peer.addr, priority, &frame.wire) {
                net_debug!("data retransmit to {} failed: {err}", rpc.peer.addr);
                inc_metric!(self.metrics, data_xmit_errors);
            } else {
                self.metrics.cell().record_packet_sent(PacketType::Data);
                inc_metric!(self.metrics, resent_packets);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> OutMeta {
        OutMeta {
            sport: 40_000,
            dport: 77,
            id: 5,
            cutoff_version: 0,
        }
    }

    #[test]
    fn short_message_is_one_frame() {
        let payload = vec![7u8; 500];
        let m = OutMessage::new(&payload, meta(), 10_000, 2_800, 0);
        assert_eq!(m.frames.len(), 1);
        assert_eq!(m.frames[0].offset, 0);
        assert_eq!(m.frames[0].data_len, 500);
        // The window widens to the cutoff boundary; granted still stops
        // at the message length.
        assert_eq!(m.unscheduled, 2_800);
        assert_eq!(m.granted, 500);
        let packet = DataPacket::new_checked(&m.frames[0].wire[..]).unwrap();
        assert_eq!(packet.message_length(), 500);
        let segs: Vec<_> = packet.segments().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].1, &payload[..]);
    }

    #[test]
    fn unscheduled_window_rounds_to_full_segments() {
        let payload = vec![1u8; 100_000];
        let m = OutMessage::new(&payload, meta(), 10_000, 150_000, 0);
        let seg = MAX_SEG_PAYLOAD as u32;
        assert_eq!(m.unscheduled, 10_000u32.div_ceil(seg) * seg);
        assert_eq!(m.granted, m.unscheduled);
        // Frames tile the message in offset order with no holes.
        let mut at = 0;
        for frame in &m.frames {
            assert_eq!(frame.offset, at);
            at = frame.end();
        }
        assert_eq!(at, 100_000);
    }

    #[test]
    fn window_branches_on_message_length() {
        // At the RTT allotment or below, the cutoff boundary sizes the
        // window, even past the message length.
        let m = OutMessage::new(&vec![0u8; 10_000], meta(), 10_000, 15_000, 0);
        assert_eq!(m.unscheduled, 15_000);
        assert_eq!(m.granted, 10_000);
        // A boundary below the length never shrinks the window.
        let m = OutMessage::new(&vec![0u8; 2_900], meta(), 10_000, 2_800, 0);
        assert_eq!(m.unscheduled, 2_900);
        // Past the allotment, the boundary is ignored.
        let seg = MAX_SEG_PAYLOAD as u32;
        let m = OutMessage::new(&vec![0u8; 100_000], meta(), 10_000, 150_000, 0);
        assert_eq!(m.unscheduled, 10_000u32.div_ceil(seg) * seg);
    }

    #[test]
    fn gso_batches_segments() {
        let payload = vec![2u8; 10_000];
        let m = OutMessage::new(&payload, meta(), 10_000, 15_000, 4 * 1500);
        let packet = DataPacket::new_checked(&m.frames[0].wire[..]).unwrap();
        let segs: Vec<_> = packet.segments().collect();
        assert_eq!(segs.len(), 4);
        assert_eq!(m.frames[0].data_len, 4 * MAX_SEG_PAYLOAD as u32);
    }

    #[test]
    fn grant_widens_monotonically() {
        let payload = vec![0u8; 100_000];
        let mut m = OutMessage::new(&payload, meta(), 10_000, 150_000, 0);
        let before = m.granted;
        assert!(m.grant_to(before + 10_000));
        assert_eq!(m.granted, before + 10_000);
        // Stale and out-of-range grants do nothing.
        assert!(!m.grant_to(before));
        assert!(m.grant_to(u32::MAX));
        assert_eq!(m.granted, 100_000);
    }

    #[test]
    fn reset_rewinds_everything() {
        let payload = vec![3u8; 50_000];
        let mut m = OutMessage::new(&payload, meta(), 10_000, u32::MAX, 0);
        m.next_frame = 3;
        DataPacket::new_unchecked(&mut m.frames[1].wire[..]).set_retransmit(true);
        m.grant_to(40_000);
        m.reset();
        assert_eq!(m.next_frame, 0);
        assert_eq!(m.granted, m.unscheduled.min(50_000));
        for frame in &m.frames {
            assert!(!DataPacket::new_checked(&frame.wire[..]).unwrap().retransmit());
        }
    }
}
