/*! Reception: reassembly of incoming messages and the packet dispatch
path.

Arriving datagrams are classified by type, looked up against the
socket and RPC tables, and merged into the per-RPC reassembly
structure. Completion moves the RPC to `Ready`, unlinks it from the
grant queue, and wakes any reader blocked on the owning socket.
*/

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::metrics::inc_metric;
use crate::rpc::{Rpc, RpcKey, RpcState};
use crate::socket::{Socket, SocketInner};
use crate::stack::{ControlBody, Stack};
use crate::time::Instant;
use crate::wire::{
    CommonPacket, CutoffsPacket, CutoffsRepr, DataPacket, GrantPacket, GrantRepr, PacketType,
    ResendPacket, ResendRepr, MAX_MESSAGE_SIZE,
};

/// Minimum spacing between CUTOFFS advertisements to one peer.
const CUTOFFS_ADVERT_GAP_NANOS: u64 = 1_000_000_000;

/// One received span of message bytes. Spans may partially overlap
/// earlier arrivals (retransmissions are whole frames); the bookkeeping
/// only ever credits newly covered bytes.
#[derive(Debug)]
pub struct Segment {
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }
}

/// Holds the state of a message being received, request or response.
#[derive(Debug)]
pub struct InMessage {
    /// Size of the entire message, in bytes.
    pub total_length: u32,

    /// Received spans, sorted by offset. Packet loss is rare, so
    /// insertion is almost always at the tail; holes appear when it is
    /// not.
    segments: Vec<Segment>,

    /// Message bytes not yet received; the scheduling key.
    pub bytes_remaining: u32,

    /// Bytes the sender will transmit without further grants. Never
    /// exceeds `total_length`.
    pub incoming: u32,

    /// Priority level to include in future GRANTs.
    pub priority: u8,

    /// True means some bytes of this message must be scheduled with
    /// grants.
    pub scheduled: bool,
}

impl InMessage {
    /// Create reassembly state for a message of `total_length` bytes of
    /// which the sender has committed to `incoming` so far.
    pub fn new(total_length: u32, incoming: u32) -> InMessage {
        let incoming = incoming.min(total_length);
        InMessage {
            total_length,
            segments: Vec::new(),
            bytes_remaining: total_length,
            incoming,
            priority: 0,
            scheduled: total_length > incoming,
        }
    }

    /// Merge one received span, returning the number of newly covered
    /// bytes (0 for a duplicate). Bytes past `total_length` are ignored.
    pub fn add_segment(&mut self, offset: u32, data: &[u8]) -> u32 {
        let mut data = data;
        if offset >= self.total_length {
            return 0;
        }
        if offset as usize + data.len() > self.total_length as usize {
            data = &data[..(self.total_length - offset) as usize];
        }
        let end = offset + data.len() as u32;

        // Walk the sorted list once: count the uncovered gaps inside
        // [offset, end) and find the insertion point.
        let mut new_bytes = 0u32;
        let mut cursor = offset;
        let mut insert_at = self.segments.len();
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.offset > offset && i < insert_at {
                insert_at = i;
            }
            if seg.end() <= cursor {
                continue;
            }
            if seg.offset >= end {
                break;
            }
            if seg.offset > cursor {
                new_bytes += seg.offset.min(end) - cursor;
            }
            cursor = cursor.max(seg.end().min(end));
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            new_bytes += end - cursor;
        }
        if new_bytes == 0 {
            return 0;
        }
        self.segments.insert(
            insert_at,
            Segment {
                offset,
                data: data.to_vec(),
            },
        );
        self.bytes_remaining -= new_bytes;
        new_bytes
    }

    /// Raise the incoming watermark; it never moves backward and never
    /// exceeds the message length.
    pub fn note_incoming(&mut self, incoming: u32) {
        self.incoming = self.incoming.max(incoming).min(self.total_length);
    }

    /// Bytes received so far.
    pub fn bytes_received(&self) -> u32 {
        self.total_length - self.bytes_remaining
    }

    /// True once every byte has arrived.
    pub fn complete(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Length of the contiguous prefix received from offset 0: the first
    /// byte a RESEND would name.
    pub fn contiguous_end(&self) -> u32 {
        let mut end = 0;
        for seg in &self.segments {
            if seg.offset > end {
                break;
            }
            end = end.max(seg.end());
        }
        end
    }

    /// Assemble the message into one contiguous buffer, delivering each
    /// byte exactly once. Call only when [`complete`](Self::complete).
    pub fn copy_out(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_length as usize];
        let mut expected = 0u32;
        for seg in &self.segments {
            let end = seg.end();
            if end <= expected {
                continue;
            }
            let from = expected.max(seg.offset);
            let skip = (from - seg.offset) as usize;
            out[from as usize..end as usize].copy_from_slice(&seg.data[skip..]);
            expected = end;
        }
        out
    }
}

/// Work that must happen after the socket lock is released.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum GrantFollowup {
    None,
    /// The focal RPC's standing in the grant queue changed; reinsert it
    /// and regrant.
    Manage,
    /// An entry left the queue; regrant the remaining candidates.
    Rebalance,
}

impl Stack {
    /// Entry point for one arriving datagram (or coalesced GSO frame)
    /// whose IP header said it came from `src`.
    pub fn handle_packet(&self, src: Ipv4Addr, frame: &[u8]) {
        inc_metric!(self.metrics, pkt_recv_calls);
        let common = match CommonPacket::new_checked(frame) {
            Ok(common) => common,
            Err(_) => {
                inc_metric!(self.metrics, short_packets);
                return;
            }
        };
        let ty = common.packet_type();
        if matches!(ty, PacketType::Unknown(_)) {
            net_trace!("dropping packet with unknown type from {src}");
            inc_metric!(self.metrics, unknown_packet_types);
            return;
        }
        self.metrics.cell().record_packet_received(ty);

        // CUTOFFS and FREEZE are peer-level: no RPC lookup.
        match ty {
            PacketType::Cutoffs => {
                self.cutoffs_pkt(src, frame);
                return;
            }
            PacketType::Freeze => {
                net_debug!("FREEZE from {src}: no diagnostic buffer in this build");
                return;
            }
            _ => {}
        }

        let sport = common.src_port();
        let dport = common.dst_port();
        let id = common.id();
        let Some(sock) = self.socktab.find(dport) else {
            net_trace!("{ty} from {src} for closed port {dport}");
            inc_metric!(self.metrics, unknown_rpcs);
            return;
        };

        let followup;
        let key;
        {
            let mut inner = sock.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            let server_side = inner.server_port != 0 && dport == inner.server_port;
            key = if server_side {
                RpcKey::Server {
                    addr: src,
                    port: sport,
                    id,
                }
            } else {
                RpcKey::Client { id }
            };
            followup = match ty {
                PacketType::Data => self.data_pkt(&sock, &mut inner, key, src, sport, frame),
                PacketType::Grant => self.grant_pkt(&sock, &mut inner, key, frame),
                PacketType::Resend => self.resend_pkt(&sock, &mut inner, key, src, sport, frame),
                PacketType::Restart => self.restart_pkt(&sock, &mut inner, key),
                PacketType::Busy => {
                    if let Some(rpc) = inner.rpc_mut(key) {
                        rpc.note_progress();
                    }
                    GrantFollowup::None
                }
                _ => GrantFollowup::None,
            };
        }
        match followup {
            GrantFollowup::None => {}
            GrantFollowup::Manage => self.manage_grants(&sock, key),
            GrantFollowup::Rebalance => self.rebalance_grants(),
        }
        self.check_pacer(Instant::now());
    }

    /// Merge one DATA packet into its RPC, creating a server RPC for the
    /// first packet of a new request.
    fn data_pkt(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
        src: Ipv4Addr,
        sport: u16,
        frame: &[u8],
    ) -> GrantFollowup {
        let packet = match DataPacket::new_checked(frame) {
            Ok(packet) => packet,
            Err(_) => {
                inc_metric!(self.metrics, short_packets);
                return GrantFollowup::None;
            }
        };
        let message_length = packet.message_length();
        if message_length == 0 || message_length > MAX_MESSAGE_SIZE {
            inc_metric!(self.metrics, short_packets);
            return GrantFollowup::None;
        }

        if inner.rpc(key).is_none() {
            match key {
                RpcKey::Server { .. } => {
                    let msgin = InMessage::new(message_length, packet.incoming());
                    let peer = self.peers.find(src, &self.metrics);
                    inner.insert_rpc(Rpc::new_server(key, peer, sport, msgin));
                }
                RpcKey::Client { .. } => {
                    net_trace!("DATA from {src} for unknown client RPC {}", key.id());
                    inc_metric!(self.metrics, unknown_rpcs);
                    return GrantFollowup::None;
                }
            }
        }
        let (complete, scheduled, total_length, stale_peer) = {
            let Some(rpc) = inner.rpc_mut(key) else {
                return GrantFollowup::None;
            };
            rpc.note_progress();

            match rpc.state {
                RpcState::Outgoing => {
                    // Client case: the first DATA of the response ends
                    // the request phase.
                    rpc.msgin = Some(InMessage::new(message_length, packet.incoming()));
                    rpc.state = RpcState::Incoming;
                }
                RpcState::Incoming => {}
                _ => {
                    // A straggler for a message already delivered.
                    net_trace!("late DATA for RPC {} in state {}", rpc.id(), rpc.state);
                    return GrantFollowup::None;
                }
            }
            let Some(msgin) = rpc.msgin.as_mut() else {
                return GrantFollowup::None;
            };
            let mut max_end = 0u32;
            for (offset, payload) in packet.segments() {
                msgin.add_segment(offset, payload);
                max_end = max_end.max(offset + payload.len() as u32);
            }
            msgin.note_incoming(packet.incoming().max(max_end));
            let stale = packet.cutoff_version() != self.config.cutoff_version;
            (
                msgin.complete(),
                msgin.scheduled,
                msgin.total_length,
                if stale { Some(rpc.peer.clone()) } else { None },
            )
        };

        if let Some(peer) = stale_peer {
            if peer.may_send_cutoffs(Instant::now(), CUTOFFS_ADVERT_GAP_NANOS) {
                let repr = CutoffsRepr {
                    cutoffs: self.config.unsched_cutoffs,
                    version: self.config.cutoff_version,
                };
                let local_port = inner.local_port(key);
                self.xmit_control(src, local_port, sport, key.id(), ControlBody::Cutoffs(repr));
            }
        }

        if complete {
            self.metrics.cell().record_msg_bytes(total_length);
            if key.is_client() {
                inc_metric!(self.metrics, responses_received);
            } else {
                inc_metric!(self.metrics, requests_received);
            }
            self.rpc_ready(sock, inner, key);
            if scheduled {
                return GrantFollowup::Rebalance;
            }
        } else if scheduled {
            return GrantFollowup::Manage;
        }
        GrantFollowup::None
    }

    /// Widen the sender window named by a GRANT and resume transmission.
    fn grant_pkt(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
        frame: &[u8],
    ) -> GrantFollowup {
        let repr = match GrantPacket::new_checked(frame).and_then(|p| GrantRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(_) => {
                inc_metric!(self.metrics, short_packets);
                return GrantFollowup::None;
            }
        };
        let Some(rpc) = inner.rpc_mut(key) else {
            inc_metric!(self.metrics, unknown_rpcs);
            return GrantFollowup::None;
        };
        rpc.note_progress();
        if rpc.state != RpcState::Outgoing {
            return GrantFollowup::None;
        }
        let Some(msgout) = rpc.msgout.as_mut() else {
            return GrantFollowup::None;
        };
        if msgout.grant_to(repr.offset) {
            msgout.sched_priority = repr.priority;
        }
        let result = self.xmit_data(sock, inner, key, false);
        self.finish_response(sock, inner, key, result);
        GrantFollowup::None
    }

    /// Answer a RESEND: replay the already-sent part of the range, tell
    /// a confused client to RESTART, or prove liveness with BUSY.
    fn resend_pkt(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
        src: Ipv4Addr,
        sport: u16,
        frame: &[u8],
    ) -> GrantFollowup {
        let repr = match ResendPacket::new_checked(frame).and_then(|p| ResendRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(_) => {
                inc_metric!(self.metrics, short_packets);
                return GrantFollowup::None;
            }
        };
        if inner.rpc(key).is_none() {
            match key {
                RpcKey::Server { .. } => {
                    // The RPC is gone (never arrived, or the response
                    // was sent and its state discarded): restart it.
                    let local_port = inner.local_port(key);
                    self.xmit_control(src, local_port, sport, key.id(), ControlBody::Restart);
                }
                RpcKey::Client { .. } => {
                    inc_metric!(self.metrics, unknown_rpcs);
                }
            }
            return GrantFollowup::None;
        }
        let sent_end = {
            let Some(rpc) = inner.rpc_mut(key) else {
                return GrantFollowup::None;
            };
            rpc.note_progress();
            rpc.msgout.as_ref().map(|m| m.sent_end()).unwrap_or(0)
        };
        if repr.offset >= sent_end {
            // Nothing already sent in that range: either the range is
            // granted-but-unsent or we are the receiver here. BUSY
            // proves we are alive without confusing the packet flow.
            let local_port = inner.local_port(key);
            let Some(rpc) = inner.rpc(key) else {
                return GrantFollowup::None;
            };
            let dport = rpc.dport;
            let dst = rpc.peer.addr;
            self.xmit_control(dst, local_port, dport, key.id(), ControlBody::Busy);
            return GrantFollowup::None;
        }
        let end = repr.offset.saturating_add(repr.length).min(sent_end);
        self.resend_data(inner, key, repr.offset, end, repr.priority);
        GrantFollowup::None
    }

    /// Start a client RPC over from offset zero, as commanded by a
    /// server that does not know it.
    fn restart_pkt(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
    ) -> GrantFollowup {
        if !key.is_client() {
            inc_metric!(self.metrics, unknown_rpcs);
            return GrantFollowup::None;
        }
        let unlink = {
            let Some(rpc) = inner.rpc_mut(key) else {
                inc_metric!(self.metrics, unknown_rpcs);
                return GrantFollowup::None;
            };
            rpc.note_progress();
            match rpc.state {
                RpcState::Ready | RpcState::ClientDone => {
                    // The response is already complete; the RESTART
                    // crossed it on the wire.
                    return GrantFollowup::None;
                }
                _ => {}
            }
            rpc.msgin = None;
            rpc.state = RpcState::Outgoing;
            if let Some(msgout) = rpc.msgout.as_mut() {
                msgout.reset();
            }
            let unlink = rpc.possibly_in_grant_queue;
            rpc.possibly_in_grant_queue = false;
            unlink
        };
        if unlink {
            self.unlink_grant(sock, key);
        }
        let result = self.xmit_data(sock, inner, key, false);
        self.finish_response(sock, inner, key, result);
        GrantFollowup::None
    }

    /// Install newly advertised unscheduled-priority cutoffs for a peer.
    fn cutoffs_pkt(&self, src: Ipv4Addr, frame: &[u8]) {
        let repr = match CutoffsPacket::new_checked(frame).and_then(|p| CutoffsRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(_) => {
                inc_metric!(self.metrics, short_packets);
                return;
            }
        };
        let peer = self.peers.find(src, &self.metrics);
        peer.set_cutoffs(&repr.cutoffs, repr.version);
        net_trace!("installed cutoffs version {} for {src}", repr.version);
    }

    /// Move a complete (or aborted) RPC to `Ready`: unlink it from the
    /// grant queue, queue it for readers, and wake them.
    pub(crate) fn rpc_ready(&self, sock: &Arc<Socket>, inner: &mut SocketInner, key: RpcKey) {
        let unlink = {
            let Some(rpc) = inner.rpc_mut(key) else {
                return;
            };
            rpc.state = RpcState::Ready;
            let unlink = rpc.possibly_in_grant_queue;
            rpc.possibly_in_grant_queue = false;
            unlink
        };
        if unlink {
            self.unlink_grant(sock, key);
        }
        inner.mark_ready(key);
        sock.ready.notify_all();
    }

    /// A server RPC is destroyed once its response is fully on the wire;
    /// lost response packets come back as RESEND → RESTART.
    pub(crate) fn finish_response(
        &self,
        sock: &Arc<Socket>,
        inner: &mut SocketInner,
        key: RpcKey,
        result: crate::outgoing::XmitResult,
    ) {
        use crate::outgoing::XmitResult;
        if key.is_client() || result != XmitResult::Complete {
            return;
        }
        let done = matches!(
            inner.rpc(key),
            Some(rpc)
                if rpc.state == RpcState::Outgoing
                    && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent())
        );
        if done {
            self.rpc_free(sock, inner, key);
        }
    }

    /// Detach an RPC from every queue it may be on and park the record
    /// on the dead list for the reaper.
    pub(crate) fn rpc_free(&self, sock: &Arc<Socket>, inner: &mut SocketInner, key: RpcKey) {
        let (unlink_grant, unlink_throttle) = match inner.rpc(key) {
            Some(rpc) => (rpc.possibly_in_grant_queue, rpc.throttled),
            None => return,
        };
        if unlink_grant {
            self.unlink_grant(sock, key);
        }
        if unlink_throttle {
            self.unlink_throttle(sock, key);
        }
        if let Some(rpc) = inner.remove_rpc(key) {
            inner.dead.push(rpc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_arrival() {
        let mut m = InMessage::new(3000, 1432);
        assert!(m.scheduled);
        assert_eq!(m.add_segment(0, &[1u8; 1432]), 1432);
        assert_eq!(m.bytes_remaining, 3000 - 1432);
        assert_eq!(m.contiguous_end(), 1432);
        assert_eq!(m.add_segment(1432, &[2u8; 1432]), 1432);
        assert_eq!(m.add_segment(2864, &[3u8; 136]), 136);
        assert!(m.complete());
        let out = m.copy_out();
        assert_eq!(out.len(), 3000);
        assert_eq!(out[0], 1);
        assert_eq!(out[1432], 2);
        assert_eq!(out[2999], 3);
    }

    #[test]
    fn duplicates_change_nothing() {
        let mut m = InMessage::new(2000, 2000);
        assert_eq!(m.add_segment(0, &[7u8; 1000]), 1000);
        let before = m.bytes_remaining;
        assert_eq!(m.add_segment(0, &[7u8; 1000]), 0);
        assert_eq!(m.bytes_remaining, before);
        assert_eq!(m.add_segment(500, &[7u8; 300]), 0);
        assert_eq!(m.bytes_remaining, before);
    }

    #[test]
    fn holes_and_partial_overlap() {
        let mut m = InMessage::new(4000, 4000);
        assert_eq!(m.add_segment(2000, &[2u8; 1000]), 1000);
        assert_eq!(m.contiguous_end(), 0);
        // Overlaps the existing span on both sides; only the gaps count.
        assert_eq!(m.add_segment(1500, &[1u8; 2500]), 1500);
        assert_eq!(m.bytes_received(), 2500);
        assert_eq!(m.add_segment(0, &[0u8; 1500]), 1500);
        assert_eq!(m.contiguous_end(), 4000);
        assert!(m.complete());
        // Every byte delivered exactly once; where spans overlap the
        // lower-offset span supplies the bytes.
        let out = m.copy_out();
        assert_eq!(out.len(), 4000);
        assert_eq!(&out[..1500], &[0u8; 1500][..]);
        assert_eq!(&out[1500..4000], &[1u8; 2500][..]);
    }

    #[test]
    fn tail_past_message_end_is_ignored() {
        let mut m = InMessage::new(1000, 1000);
        assert_eq!(m.add_segment(500, &[9u8; 1000]), 500);
        assert_eq!(m.add_segment(1000, &[9u8; 10]), 0);
        assert_eq!(m.bytes_received(), 500);
    }

    #[test]
    fn incoming_watermark_clamps() {
        let mut m = InMessage::new(1000, 400);
        m.note_incoming(200);
        assert_eq!(m.incoming, 400);
        m.note_incoming(5000);
        assert_eq!(m.incoming, 1000);
    }

    #[test]
    fn unscheduled_message_never_schedules() {
        let m = InMessage::new(500, 500);
        assert!(!m.scheduled);
    }
}
