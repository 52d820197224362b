/*! The engine aggregate: tables, queues, tunables, workers, and the
socket surface.

One [`Stack`] exists per transport instance. Application threads enter
through [`SocketHandle`]s, the host's receive path enters through
[`Stack::handle_packet`], and two background workers (timer and pacer)
enter on their own schedules. All of them run concurrently; the lock
order is socket → grant queue → throttle queue → table writer locks,
with the hot counters (link idle time, pacer guard, metrics) on
atomics.
*/

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::grant::GrantQueue;
use crate::metrics::{inc_metric, Metrics};
use crate::outgoing::{OutMessage, OutMeta};
use crate::pacer::Throttle;
use crate::peer::PeerTable;
use crate::rpc::{Rpc, RpcKey, RpcState};
use crate::socket::{Error, Result, Socket, SocketHandle};
use crate::socktab::{SockTab, MIN_CLIENT_PORT};
use crate::time::Instant;
use crate::wire::{
    common, CommonPacket, CutoffsPacket, CutoffsRepr, GrantPacket, GrantRepr, PacketType,
    ResendPacket, ResendRepr, MAX_MESSAGE_SIZE,
};

/// Payload of an outgoing control packet.
pub(crate) enum ControlBody {
    Grant(GrantRepr),
    Resend(ResendRepr),
    Restart,
    Busy,
    Cutoffs(CutoffsRepr),
    Freeze,
}

impl ControlBody {
    fn packet_type(&self) -> PacketType {
        match self {
            ControlBody::Grant(_) => PacketType::Grant,
            ControlBody::Resend(_) => PacketType::Resend,
            ControlBody::Restart => PacketType::Restart,
            ControlBody::Busy => PacketType::Busy,
            ControlBody::Cutoffs(_) => PacketType::Cutoffs,
            ControlBody::Freeze => PacketType::Freeze,
        }
    }

    fn buffer_len(&self) -> usize {
        match self {
            ControlBody::Grant(r) => r.buffer_len(),
            ControlBody::Resend(r) => r.buffer_len(),
            ControlBody::Cutoffs(r) => r.buffer_len(),
            _ => common::HEADER_LEN,
        }
    }
}

/// One transport engine instance.
pub struct Stack {
    pub(crate) device: Arc<dyn crate::phy::Device>,
    pub(crate) config: Config,

    /// Nanoseconds to put 1000 bytes on the uplink; drives the NIC
    /// occupancy estimate.
    pub(crate) ns_per_kbyte: u64,

    /// Effective segmentation-offload frame limit: the device cap,
    /// possibly lowered by configuration. 0 means one segment per
    /// frame.
    pub(crate) gso_limit: usize,

    /// All open sockets, indexed by port.
    pub(crate) socktab: SockTab,

    /// Every distant host we have talked to, indexed by address.
    pub(crate) peers: PeerTable,

    /// Incoming messages waiting for grants, smallest remaining first.
    pub(crate) grants: GrantQueue,

    /// RPCs whose transmission the occupancy ceiling paused, plus the
    /// link-idle estimate and the pacer guard.
    pub(crate) throttle: Throttle,

    pub(crate) metrics: Metrics,

    /// Number of timer ticks so far; wraps harmlessly.
    pub(crate) timer_ticks: AtomicU32,

    /// Tells the background workers to wind down.
    pub(crate) exit: AtomicBool,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Build an engine on top of `device`.
    pub fn new(device: Arc<dyn crate::phy::Device>, config: Config) -> Arc<Stack> {
        config.validate();
        let caps = device.capabilities();
        let gso_limit = match (caps.max_gso_size, config.max_gso_size) {
            (0, _) => 0,
            (dev, 0) => dev,
            (dev, cfg) => dev.min(cfg),
        };
        let ns_per_kbyte = config.ns_per_kbyte();
        let peers = PeerTable::new(config.unsched_cutoffs);
        Arc::new(Stack {
            device,
            ns_per_kbyte,
            gso_limit,
            socktab: SockTab::new(),
            peers,
            grants: GrantQueue::new(),
            throttle: Throttle::new(),
            metrics: Metrics::new(),
            timer_ticks: AtomicU32::new(0),
            exit: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Open a socket: allocates a client port immediately; call
    /// [`SocketHandle::bind`] to accept requests as a server.
    pub fn open(self: &Arc<Self>) -> SocketHandle {
        let sock = Arc::new(Socket::new(0));
        let port = self.socktab.alloc_client_port(&sock);
        sock.inner.lock().unwrap().client_port = port;
        net_debug!("opened socket with client port {port}");
        SocketHandle {
            stack: self.clone(),
            sock,
        }
    }

    /// Spawn the pacer and timer worker threads. Idempotent.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        let stack = self.clone();
        workers.push(
            std::thread::Builder::new()
                .name("transport-pacer".into())
                .spawn(move || stack.pacer_main())
                .unwrap(),
        );
        let stack = self.clone();
        workers.push(
            std::thread::Builder::new()
                .name("transport-timer".into())
                .spawn(move || stack.timer_main())
                .unwrap(),
        );
    }

    /// Stop the background workers and wait for them.
    pub fn shutdown(&self) {
        self.exit.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Compile the metrics snapshot into a human-readable text blob.
    pub fn print_metrics(&self) -> String {
        self.metrics.compile()
    }

    /// Ask `dst` to freeze its diagnostic trace buffer.
    pub fn freeze_peer(&self, dst: Ipv4Addr) {
        self.xmit_control(dst, 0, 0, 0, ControlBody::Freeze);
    }

    pub(crate) fn bind(&self, sock: &Arc<Socket>, port: u16) -> Result<()> {
        if port == 0 || port >= MIN_CLIENT_PORT {
            return Err(Error::InvalidArgument);
        }
        let mut inner = sock.inner.lock().unwrap();
        if inner.shutdown {
            return Err(Error::Shutdown);
        }
        if inner.server_port != 0 {
            return Err(Error::InvalidArgument);
        }
        if !self.socktab.insert(port, sock) {
            return Err(Error::InvalidArgument);
        }
        inner.server_port = port;
        Ok(())
    }

    /// Create a client RPC carrying `payload` to `dest` and start
    /// transmitting it.
    pub(crate) fn send(
        &self,
        sock: &Arc<Socket>,
        dest: SocketAddrV4,
        payload: &[u8],
    ) -> Result<u64> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(Error::InvalidArgument);
        }
        if let Err(err) = self.device.check_route(*dest.ip()) {
            net_debug!("no route to {}: {err}", dest.ip());
            inc_metric!(self.metrics, route_errors);
            return Err(Error::Route);
        }
        let peer = self.peers.find(*dest.ip(), &self.metrics);

        let mut inner = sock.inner.lock().unwrap();
        if inner.shutdown {
            return Err(Error::Shutdown);
        }
        let id = inner.next_outgoing_id;
        inner.next_outgoing_id += 1;
        let key = RpcKey::Client { id };
        let meta = OutMeta {
            sport: inner.client_port,
            dport: dest.port(),
            id,
            cutoff_version: peer.cutoff_version(),
        };
        let boundary = peer.unsched_boundary(payload.len() as u32);
        let msgout = OutMessage::new(
            payload,
            meta,
            self.config.rtt_bytes,
            boundary,
            self.gso_limit,
        );
        let mut rpc = Rpc::new_client(key, peer, dest.port());
        rpc.msgout = Some(msgout);
        inner.insert_rpc(rpc);
        net_trace!("client RPC {id} to {dest}: {} bytes", payload.len());
        let _ = self.xmit_data(sock, &mut inner, key, false);
        drop(inner);
        self.check_pacer(Instant::now());
        Ok(id)
    }

    /// Attach the response to a request previously delivered to the
    /// application and start transmitting it.
    pub(crate) fn reply(
        &self,
        sock: &Arc<Socket>,
        peer: SocketAddrV4,
        id: u64,
        payload: &[u8],
    ) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(Error::InvalidArgument);
        }
        let key = RpcKey::Server {
            addr: *peer.ip(),
            port: peer.port(),
            id,
        };
        let mut inner = sock.inner.lock().unwrap();
        if inner.shutdown {
            return Err(Error::Shutdown);
        }
        let (cutoff_version, boundary) = {
            let Some(rpc) = inner.rpc_mut(key) else {
                return Err(Error::InvalidArgument);
            };
            if rpc.state != RpcState::InService {
                return Err(Error::InvalidArgument);
            }
            rpc.state = RpcState::Outgoing;
            (
                rpc.peer.cutoff_version(),
                rpc.peer.unsched_boundary(payload.len() as u32),
            )
        };
        let meta = OutMeta {
            sport: inner.server_port,
            dport: peer.port(),
            id,
            cutoff_version,
        };
        let msgout = OutMessage::new(
            payload,
            meta,
            self.config.rtt_bytes,
            boundary,
            self.gso_limit,
        );
        if let Some(rpc) = inner.rpc_mut(key) {
            rpc.msgout = Some(msgout);
        }
        net_trace!("reply for RPC {id} to {peer}: {} bytes", payload.len());
        let result = self.xmit_data(sock, &mut inner, key, false);
        self.finish_response(sock, &mut inner, key, result);
        drop(inner);
        self.check_pacer(Instant::now());
        Ok(())
    }

    /// Tear a socket down: abort everything it owns, wake its readers,
    /// release its ports.
    pub(crate) fn close_socket(&self, sock: &Arc<Socket>) {
        let (client_port, server_port) = {
            let mut inner = sock.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            let keys = inner.active.clone();
            for key in keys {
                if let Some(rpc) = inner.rpc_mut(key) {
                    if rpc.possibly_in_grant_queue {
                        rpc.possibly_in_grant_queue = false;
                        self.unlink_grant(sock, key);
                    }
                    if rpc.throttled {
                        rpc.throttled = false;
                        self.unlink_throttle(sock, key);
                    }
                }
            }
            inner.client_rpcs.clear();
            inner.server_rpcs.clear();
            inner.active.clear();
            inner.dead.clear();
            inner.ready_requests.clear();
            inner.ready_responses.clear();
            (inner.client_port, inner.server_port)
        };
        sock.ready.notify_all();
        self.socktab.remove(client_port);
        if server_port != 0 {
            self.socktab.remove(server_port);
        }
        self.rebalance_grants();
        net_debug!("closed socket with client port {client_port}");
    }

    /// Build and transmit one control packet. Control packets are small
    /// and latency-critical: they go out at top priority and bypass the
    /// pacer.
    pub(crate) fn xmit_control(
        &self,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        id: u64,
        body: ControlBody,
    ) {
        let ty = body.packet_type();
        let mut buffer = vec![0u8; body.buffer_len()];
        let mut header = CommonPacket::new_unchecked(&mut buffer[..]);
        header.set_src_port(sport);
        header.set_dst_port(dport);
        header.set_packet_type(ty);
        header.set_id(id);
        header.set_doff(0);
        header.clear_unused();
        match body {
            ControlBody::Grant(r) => {
                r.emit(&mut GrantPacket::new_unchecked(&mut buffer[..]));
            }
            ControlBody::Resend(r) => {
                r.emit(&mut ResendPacket::new_unchecked(&mut buffer[..]));
            }
            ControlBody::Cutoffs(r) => {
                r.emit(&mut CutoffsPacket::new_unchecked(&mut buffer[..]));
            }
            ControlBody::Restart | ControlBody::Busy | ControlBody::Freeze => {}
        }
        match self.device.transmit(dst, self.config.max_prio, &buffer) {
            Ok(()) => self.metrics.cell().record_packet_sent(ty),
            Err(err) => {
                net_debug!("{ty} transmit to {dst} failed: {err}");
                inc_metric!(self.metrics, control_xmit_errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::phy::Loopback;
    use crate::rpc::AbortReason;
    use crate::socket::{MessageKind, RecvFlags};
    use crate::wire::{data, DataPacket, MAX_SEG_PAYLOAD};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const A_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn nonblock() -> RecvFlags {
        RecvFlags {
            nonblocking: true,
            ..RecvFlags::default()
        }
    }

    /// A configuration whose link is so fast and whose queue ceiling so
    /// high that the pacer never intervenes; lets the other subsystems
    /// be observed in isolation.
    fn fast_config() -> Config {
        Config {
            link_mbps: 1_000_000,
            max_nic_queue_ns: 1_000_000_000,
            ..Config::default()
        }
    }

    struct Pair {
        a: Arc<Stack>,
        b: Arc<Stack>,
        a_dev: Arc<Loopback>,
        b_dev: Arc<Loopback>,
    }

    fn pair(config: Config) -> Pair {
        let a_dev = Arc::new(Loopback::default());
        let b_dev = Arc::new(Loopback::default());
        let a = Stack::new(a_dev.clone(), config.clone());
        let b = Stack::new(b_dev.clone(), config);
        Pair { a, b, a_dev, b_dev }
    }

    /// Ferry frames between the two stacks until both outputs go quiet,
    /// recording every frame as (sent_by_a, priority, bytes).
    fn pump(pair: &Pair) -> Vec<(bool, u8, Vec<u8>)> {
        pump_filtered(pair, |_, _| true)
    }

    /// Like `pump`, but frames for which `keep` returns false vanish on
    /// the wire (they are still recorded).
    fn pump_filtered(
        pair: &Pair,
        mut keep: impl FnMut(bool, &[u8]) -> bool,
    ) -> Vec<(bool, u8, Vec<u8>)> {
        let mut log = Vec::new();
        loop {
            let mut moved = false;
            while let Some((dst, priority, frame)) = pair.a_dev.dequeue() {
                moved = true;
                let deliver = dst == B_ADDR && keep(true, &frame);
                log.push((true, priority, frame.clone()));
                if deliver {
                    pair.b.handle_packet(A_ADDR, &frame);
                }
            }
            while let Some((dst, priority, frame)) = pair.b_dev.dequeue() {
                moved = true;
                let deliver = dst == A_ADDR && keep(false, &frame);
                log.push((false, priority, frame.clone()));
                if deliver {
                    pair.a.handle_packet(B_ADDR, &frame);
                }
            }
            if !moved {
                break;
            }
        }
        log
    }

    fn packet_type(frame: &[u8]) -> PacketType {
        CommonPacket::new_unchecked(frame).packet_type()
    }

    fn data_offset(frame: &[u8]) -> u32 {
        DataPacket::new_unchecked(frame)
            .segments()
            .next()
            .map(|(offset, _)| offset)
            .unwrap_or(0)
    }

    /// Hand-build a single-segment DATA frame, for driving one stack
    /// directly.
    fn data_frame(
        sport: u16,
        dport: u16,
        id: u64,
        total: u32,
        offset: u32,
        payload: &[u8],
        incoming: u32,
        cutoff_version: u16,
    ) -> Vec<u8> {
        let mut buffer = vec![0u8; data::buffer_len(&[payload.len()])];
        let mut header = CommonPacket::new_unchecked(&mut buffer[..]);
        header.set_src_port(sport);
        header.set_dst_port(dport);
        header.set_packet_type(PacketType::Data);
        header.set_id(id);
        header.set_doff(data::DOFF);
        header.clear_unused();
        let mut packet = DataPacket::new_unchecked(&mut buffer[..]);
        packet.set_message_length(total);
        packet.set_incoming(incoming);
        packet.set_cutoff_version(cutoff_version);
        packet.set_retransmit(false);
        packet.emit_segment(0, offset, payload);
        buffer
    }

    #[test]
    fn unscheduled_small_message_round_trip() {
        let p = pair(fast_config());
        let server = p.b.open();
        server.bind(500).unwrap();
        let client = p.a.open();
        let payload: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let id = client.send(SocketAddrV4::new(B_ADDR, 500), &payload).unwrap();

        let log = pump(&p);
        let data_frames = log
            .iter()
            .filter(|(from_a, _, f)| *from_a && packet_type(f) == PacketType::Data)
            .count();
        assert_eq!(data_frames, 1);
        assert!(log.iter().all(|(_, _, f)| packet_type(f) != PacketType::Grant));

        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.id, id);
        assert_eq!(*msg.peer.ip(), A_ADDR);
        assert_eq!(msg.payload, payload);

        server.reply(msg.peer, msg.id, b"pong").unwrap();
        pump(&p);
        let resp = client.recv_response(id, nonblock()).unwrap();
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.payload, b"pong");
    }

    #[test]
    fn scheduled_message_walks_the_grant_ladder() {
        let mut config = fast_config();
        config.rtt_bytes = 30_000;
        config.grant_increment = 10_000;
        config.max_overcommit = 8;
        let p = pair(config);
        let server = p.b.open();
        server.bind(77).unwrap();
        let client = p.a.open();
        let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        let id = client.send(SocketAddrV4::new(B_ADDR, 77), &payload).unwrap();

        let log = pump(&p);
        let grants: Vec<u32> = log
            .iter()
            .filter(|(from_a, _, f)| !*from_a && packet_type(f) == PacketType::Grant)
            .map(|(_, _, f)| GrantPacket::new_unchecked(&f[..]).offset())
            .collect();
        assert!(grants.len() > 40);
        assert!(grants.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(*grants.last().unwrap(), 500_000);

        // The sender never began a frame at or past its granted window.
        let seg = MAX_SEG_PAYLOAD as u32;
        let mut granted = 30_000u32.div_ceil(seg) * seg;
        for (from_a, _, frame) in &log {
            match packet_type(frame) {
                PacketType::Grant if !*from_a => {
                    granted = granted.max(GrantPacket::new_unchecked(&frame[..]).offset());
                }
                PacketType::Data if *from_a => {
                    assert!(data_offset(frame) < granted);
                }
                _ => {}
            }
        }

        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn lost_data_is_resent_and_delivered_once() {
        let mut config = fast_config();
        config.rtt_bytes = 30_000;
        let p = pair(config.clone());
        let server = p.b.open();
        server.bind(88).unwrap();
        let client = p.a.open();
        let payload: Vec<u8> = (0..30_000u32).map(|i| (i * 7 % 256) as u8).collect();
        client.send(SocketAddrV4::new(B_ADDR, 88), &payload).unwrap();

        let drop_off = 14 * MAX_SEG_PAYLOAD as u32;
        let mut dropped = false;
        pump_filtered(&p, |from_a, f| {
            if from_a
                && packet_type(f) == PacketType::Data
                && !dropped
                && data_offset(f) == drop_off
            {
                dropped = true;
                return false;
            }
            true
        });
        assert!(dropped);
        assert!(server.recv(nonblock()).is_err());

        // Age the receiver until it asks for the hole.
        for _ in 0..config.resend_ticks {
            p.b.timer_tick();
        }
        let log = pump(&p);
        let resends: Vec<&Vec<u8>> = log
            .iter()
            .filter(|(from_a, _, f)| !*from_a && packet_type(f) == PacketType::Resend)
            .map(|(_, _, f)| f)
            .collect();
        assert_eq!(resends.len(), 1);
        let resend = ResendPacket::new_unchecked(&resends[0][..]);
        assert_eq!(resend.offset(), drop_off);

        // Every replayed frame is flagged as a retransmission.
        let replayed: Vec<&Vec<u8>> = log
            .iter()
            .filter(|(from_a, _, f)| *from_a && packet_type(f) == PacketType::Data)
            .map(|(_, _, f)| f)
            .collect();
        assert!(!replayed.is_empty());
        assert!(replayed
            .iter()
            .all(|f| DataPacket::new_unchecked(&f[..]).retransmit()));

        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.payload, payload);
        assert!(server.recv(nonblock()).is_err());
    }

    #[test]
    fn unknown_rpc_resend_triggers_restart() {
        let config = fast_config();
        let p = pair(config.clone());
        let server = p.b.open();
        server.bind(99).unwrap();
        let client = p.a.open();
        let payload = vec![0x5au8; 3_000];
        let id = client.send(SocketAddrV4::new(B_ADDR, 99), &payload).unwrap();

        // The entire request evaporates on the wire.
        pump_filtered(&p, |from_a, f| {
            !(from_a && packet_type(f) == PacketType::Data)
        });
        for _ in 0..config.resend_ticks {
            p.a.timer_tick();
        }
        let log = pump(&p);
        assert!(log
            .iter()
            .any(|(from_a, _, f)| *from_a && packet_type(f) == PacketType::Resend));
        assert!(log
            .iter()
            .any(|(from_a, _, f)| !*from_a && packet_type(f) == PacketType::Restart));

        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.payload, payload);
        server.reply(msg.peer, msg.id, b"done").unwrap();
        pump(&p);
        let resp = client.recv_response(id, nonblock()).unwrap();
        assert_eq!(resp.payload, b"done");
        assert!(client.recv_response(id, nonblock()).is_err());
    }

    #[test]
    fn overcommit_bounds_concurrent_grants() {
        let mut config = fast_config();
        config.max_overcommit = 4;
        config.rtt_bytes = 10_000;
        config.grant_increment = 10_000;
        let b_dev = Arc::new(Loopback::default());
        let b = Stack::new(b_dev.clone(), config.clone());
        let server = b.open();
        server.bind(55).unwrap();

        let total = 30_000u32;
        let seg = MAX_SEG_PAYLOAD;
        for host in 0..10u8 {
            let src = Ipv4Addr::new(10, 0, 1, host);
            let frame = data_frame(
                40_000,
                55,
                1,
                total,
                0,
                &vec![host; seg],
                seg as u32,
                config.cutoff_version,
            );
            b.handle_packet(src, &frame);
        }
        assert_eq!(b.grants.len(), 10);
        // The queue stays sorted by (bytes remaining, arrival order).
        let keys = b.grants.keys();
        assert!(keys.windows(2).all(|w| w[0].1 <= w[1].1));

        // Exactly the top max_overcommit hosts hold grants, with
        // priorities in rank order.
        let mut grants: Vec<(Ipv4Addr, u32, u8)> = Vec::new();
        while let Some((dst, _, frame)) = b_dev.dequeue() {
            if packet_type(&frame) == PacketType::Grant {
                let packet = GrantPacket::new_unchecked(&frame[..]);
                grants.push((dst, packet.offset(), packet.priority()));
            }
        }
        assert_eq!(grants.len(), 4);
        for (rank, (dst, offset, priority)) in grants.iter().enumerate() {
            assert_eq!(*dst, Ipv4Addr::new(10, 0, 1, rank as u8));
            assert_eq!(*offset, seg as u32 + config.grant_increment);
            assert_eq!(*priority, config.max_sched_prio - rank as u8);
        }

        // Completing one recipient promotes the next-best message.
        let src = Ipv4Addr::new(10, 0, 1, 0);
        let mut at = seg as u32;
        while at < total {
            let len = ((total - at) as usize).min(seg);
            let frame = data_frame(
                40_000,
                55,
                1,
                total,
                at,
                &vec![0u8; len],
                total,
                config.cutoff_version,
            );
            b.handle_packet(src, &frame);
            at += len as u32;
        }
        assert_eq!(b.grants.len(), 9);
        // While host 0 drained it kept earning top-ups; the only grant
        // to anyone new goes to the fifth-oldest message.
        let mut promoted = Vec::new();
        while let Some((dst, _, frame)) = b_dev.dequeue() {
            if packet_type(&frame) == PacketType::Grant && dst != src {
                promoted.push(dst);
            }
        }
        assert_eq!(promoted, vec![Ipv4Addr::new(10, 0, 1, 4)]);

        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.payload.len(), total as usize);
    }

    #[test]
    fn pacer_bounds_nic_occupancy() {
        let mut config = Config::default();
        config.link_mbps = 1_000;
        config.max_nic_queue_ns = 5_000;
        config.rtt_bytes = 30_000;
        let p = pair(config.clone());
        let server = p.b.open();
        server.bind(44).unwrap();
        let client = p.a.open();
        let dest = SocketAddrV4::new(B_ADDR, 44);
        let id1 = client.send(dest, &vec![1u8; 20_000]).unwrap();
        let id2 = client.send(dest, &vec![2u8; 20_000]).unwrap();

        // A full-size frame alone overruns the 5 µs ceiling, so both
        // RPCs must be pacing.
        assert!(p.a.throttle.len() >= 1);
        let frame_ns = 1_544 * p.a.ns_per_kbyte / 1_000;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while p.a.throttle.len() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "pacer failed to drain the throttle queue"
            );
            p.a.pacer_xmit();
            let now = Instant::now().total_nanos();
            let idle = p.a.throttle.link_idle_time.load(Ordering::Acquire);
            // Never more than the ceiling plus one forced frame.
            assert!(idle.saturating_sub(now) <= config.max_nic_queue_ns + frame_ns);
            std::thread::sleep(std::time::Duration::from_micros(20));
        }
        pump(&p);

        let first = server.recv(nonblock()).unwrap();
        let second = server.recv(nonblock()).unwrap();
        assert_eq!(first.id, id1);
        assert_eq!(second.id, id2);
        assert_eq!(first.payload, vec![1u8; 20_000]);
        assert_eq!(second.payload, vec![2u8; 20_000]);
    }

    #[test]
    fn random_loss_still_delivers_exactly_once() {
        let mut config = fast_config();
        config.rtt_bytes = 60_000;
        let p = pair(config.clone());
        let server = p.b.open();
        server.bind(22).unwrap();
        let client = p.a.open();
        let mut rng = StdRng::seed_from_u64(0x1dea);
        let payload: Vec<u8> = (0..60_000).map(|_| rng.gen()).collect();
        client.send(SocketAddrV4::new(B_ADDR, 22), &payload).unwrap();

        // 30% of first transmissions vanish; retransmissions survive.
        pump_filtered(&p, |from_a, f| {
            !(from_a
                && packet_type(f) == PacketType::Data
                && !DataPacket::new_unchecked(f).retransmit()
                && rng.gen_bool(0.3))
        });
        for _ in 0..60 {
            p.b.timer_tick();
            pump(&p);
            if server.poll() {
                break;
            }
        }
        let msg = server.recv(nonblock()).unwrap();
        assert_eq!(msg.payload, payload);
        assert!(server.recv(nonblock()).is_err());
    }

    #[test]
    fn silent_peer_times_out_the_client_rpc() {
        let p = pair(fast_config());
        let client = p.a.open();
        let id = client.send(SocketAddrV4::new(B_ADDR, 66), b"hello").unwrap();
        // Nothing ever comes back.
        for _ in 0..100 {
            p.a.timer_tick();
        }
        let err = client.recv_response(id, nonblock()).unwrap_err();
        assert_eq!(
            err,
            Error::RpcAborted {
                id,
                reason: AbortReason::Timeout
            }
        );
        // The failure surfaces exactly once.
        assert_eq!(client.recv(nonblock()).unwrap_err(), Error::WouldBlock);
    }

    #[test]
    fn stale_cutoff_version_triggers_advertisement() {
        let config = fast_config();
        let b_dev = Arc::new(Loopback::default());
        let b = Stack::new(b_dev.clone(), config.clone());
        let server = b.open();
        server.bind(33).unwrap();

        let src = Ipv4Addr::new(10, 0, 9, 9);
        let frame = data_frame(40_000, 33, 1, 400, 0, &[9u8; 400], 400, 0);
        b.handle_packet(src, &frame);

        let mut advert = None;
        while let Some((dst, _, frame)) = b_dev.dequeue() {
            if packet_type(&frame) == PacketType::Cutoffs {
                assert_eq!(dst, src);
                advert = Some(CutoffsRepr::parse(&CutoffsPacket::new_unchecked(&frame[..])).unwrap());
            }
        }
        let advert = advert.expect("no CUTOFFS advertisement");
        assert_eq!(advert.version, config.cutoff_version);
        assert_eq!(advert.cutoffs, config.unsched_cutoffs);
    }

    #[test]
    fn surface_validation() {
        let p = pair(fast_config());
        let sock = p.a.open();
        assert_eq!(sock.bind(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(sock.bind(MIN_CLIENT_PORT).unwrap_err(), Error::InvalidArgument);
        sock.bind(123).unwrap();
        assert_eq!(sock.bind(124).unwrap_err(), Error::InvalidArgument);
        let other = p.a.open();
        assert_eq!(other.bind(123).unwrap_err(), Error::InvalidArgument);

        let dest = SocketAddrV4::new(B_ADDR, 1);
        assert_eq!(sock.send(dest, &[]).unwrap_err(), Error::InvalidArgument);
        let oversize = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        assert_eq!(sock.send(dest, &oversize).unwrap_err(), Error::InvalidArgument);
        assert_eq!(sock.recv(nonblock()).unwrap_err(), Error::WouldBlock);
        assert_eq!(
            sock.reply(dest, 1, b"x").unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn closed_socket_rejects_operations() {
        let p = pair(fast_config());
        let client = p.a.open();
        let port = client.client_port();
        client.close();
        assert!(client.poll());
        assert_eq!(
            client.send(SocketAddrV4::new(B_ADDR, 1), b"x").unwrap_err(),
            Error::Shutdown
        );
        assert_eq!(client.recv(RecvFlags::default()).unwrap_err(), Error::Shutdown);
        // The port is free for reuse and stray packets are dropped, not
        // crashed on.
        assert!(p.a.socktab.find(port).is_none());
        let frame = data_frame(40_000, port, 1, 100, 0, &[0u8; 100], 100, 1);
        p.a.handle_packet(B_ADDR, &frame);
    }

    #[test]
    fn dest_abort_fails_every_rpc_to_the_peer() {
        let p = pair(fast_config());
        let client = p.a.open();
        let id1 = client.send(SocketAddrV4::new(B_ADDR, 5), b"one").unwrap();
        let id2 = client.send(SocketAddrV4::new(B_ADDR, 6), b"two").unwrap();
        p.a.dest_abort(B_ADDR, AbortReason::PeerCrash);
        for id in [id1, id2] {
            assert_eq!(
                client.recv_response(id, nonblock()).unwrap_err(),
                Error::RpcAborted {
                    id,
                    reason: AbortReason::PeerCrash
                }
            );
        }
    }

    #[test]
    fn freeze_is_counted_and_harmless() {
        let p = pair(fast_config());
        p.a.freeze_peer(B_ADDR);
        let log = pump(&p);
        assert!(log
            .iter()
            .any(|(from_a, _, f)| *from_a && packet_type(f) == PacketType::Freeze));
        assert!(p.b.print_metrics().contains("packets_rcvd_FREEZE"));
    }

    #[test]
    fn workers_start_and_stop() {
        let p = pair(fast_config());
        p.a.start_workers();
        std::thread::sleep(std::time::Duration::from_millis(5));
        p.a.shutdown();
        // Ticks advanced while the workers ran.
        assert!(p.a.timer_ticks.load(Ordering::Acquire) > 0);
    }
}
