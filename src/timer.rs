/*! The timer: silent-RPC aging, RESEND emission, timeout aborts, and
dead-RPC reaping.

Invoked at a fixed tick, typically every millisecond. An RPC that
receives any packet resets its silent-tick count; one that stays silent
past `resend_ticks` while it is owed data starts asking for
retransmission, and after `abort_resends` fruitless RESENDs it is given
up on: client RPCs surface a timeout through the read path, server RPCs
vanish silently (the client will RESEND and be told to RESTART).
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::metrics::inc_metric;
use crate::rpc::{AbortReason, RpcKey, RpcState};
use crate::socket::Socket;
use crate::stack::{ControlBody, Stack};
use crate::time::Instant;
use crate::wire::ResendRepr;

enum TimerAction {
    Skip,
    Resend { start: u32, length: u32, priority: u8 },
    AbortClient,
    DestroyServer,
}

impl Stack {
    /// One tick of the timer. Normally driven by the worker thread
    /// started with [`Stack::start_workers`]; tests call it directly.
    pub fn timer_tick(&self) {
        let start = Instant::now();
        let tick = self.timer_ticks.fetch_add(1, Ordering::AcqRel) + 1;
        for sock in self.socktab.sockets() {
            self.timer_check_socket(&sock, tick);
        }
        inc_metric!(
            self.metrics,
            timer_cycles,
            Instant::now().total_nanos() - start.total_nanos()
        );
    }

    fn timer_check_socket(&self, sock: &Arc<Socket>, tick: u32) {
        let mut inner = sock.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        // Walk a snapshot: aborts edit the active list underneath us.
        let keys = inner.active.clone();
        for key in keys {
            let action = self.age_rpc(&mut inner, key, tick);
            match action {
                TimerAction::Skip => {}
                TimerAction::Resend {
                    start,
                    length,
                    priority,
                } => {
                    let sport = inner.local_port(key);
                    let (dst, dport) = match inner.rpc(key) {
                        Some(rpc) => (rpc.peer.addr, rpc.dport),
                        None => continue,
                    };
                    net_trace!(
                        "RESEND [{start}, +{length}) for silent RPC {} to {dst}",
                        key.id()
                    );
                    let repr = ResendRepr {
                        offset: start,
                        length,
                        priority,
                    };
                    self.xmit_control(dst, sport, dport, key.id(), ControlBody::Resend(repr));
                }
                TimerAction::AbortClient => {
                    net_debug!("aborting client RPC {} after resend budget", key.id());
                    inc_metric!(self.metrics, client_rpc_timeouts);
                    self.rpc_abort(sock, &mut inner, key, AbortReason::Timeout);
                }
                TimerAction::DestroyServer => {
                    net_debug!("destroying silent server RPC {}", key.id());
                    inc_metric!(self.metrics, server_rpc_timeouts);
                    self.rpc_free(sock, &mut inner, key);
                }
            }
        }
        // Release a bounded batch of freed RPCs' buffers.
        let reap = inner.dead.len().min(self.config.reap_limit);
        inner.dead.drain(..reap);
    }

    /// Age one RPC by a tick and decide what, if anything, to do about
    /// its silence.
    fn age_rpc(
        &self,
        inner: &mut crate::socket::SocketInner,
        key: RpcKey,
        tick: u32,
    ) -> TimerAction {
        let config = &self.config;
        let Some(rpc) = inner.rpc_mut(key) else {
            return TimerAction::Skip;
        };
        match rpc.state {
            RpcState::Ready | RpcState::InService | RpcState::ClientDone => {
                // Waiting on the application, not the network.
                return TimerAction::Skip;
            }
            _ => {}
        }
        rpc.silent_ticks += 1;
        if rpc.silent_ticks < config.resend_ticks {
            return TimerAction::Skip;
        }
        if rpc.awaiting_data() {
            if rpc.num_resends >= config.abort_resends {
                return if rpc.is_client() {
                    TimerAction::AbortClient
                } else {
                    TimerAction::DestroyServer
                };
            }
            if !rpc.peer.may_send_resend(tick, config.resend_interval) {
                return TimerAction::Skip;
            }
            rpc.num_resends += 1;
            return match rpc.msgin.as_ref() {
                Some(msgin) if !msgin.complete() => {
                    let start = msgin.contiguous_end();
                    // Everything promised has arrived but the message is
                    // short: ask onward from the frontier.
                    let end = if msgin.incoming > start {
                        msgin.incoming
                    } else {
                        start + config.rtt_bytes
                    };
                    TimerAction::Resend {
                        start,
                        length: end - start,
                        priority: msgin.priority,
                    }
                }
                // Nothing of the response has arrived yet.
                _ => TimerAction::Resend {
                    start: 0,
                    length: config.rtt_bytes,
                    priority: config.max_prio,
                },
            };
        }
        // A server whose response transmission stalls gets no RESENDs
        // (the client asks for those); it just times out eventually.
        if !rpc.is_client() && rpc.state == RpcState::Outgoing {
            let deadline =
                config.resend_ticks + config.abort_resends * config.resend_interval.max(1);
            if rpc.silent_ticks >= deadline {
                return TimerAction::DestroyServer;
            }
        }
        TimerAction::Skip
    }

    /// Fail an RPC: park the reason, detach it from the transmit
    /// machinery, and surface it through the read path.
    pub(crate) fn rpc_abort(
        &self,
        sock: &Arc<Socket>,
        inner: &mut crate::socket::SocketInner,
        key: RpcKey,
        reason: AbortReason,
    ) {
        let throttled = {
            let Some(rpc) = inner.rpc_mut(key) else {
                return;
            };
            rpc.error = Some(reason);
            let throttled = rpc.throttled;
            rpc.throttled = false;
            throttled
        };
        if throttled {
            self.unlink_throttle(sock, key);
        }
        self.rpc_ready(sock, inner, key);
    }

    /// Abort every client RPC aimed at `addr`: the contract for a host
    /// error handler that learns the peer crashed or became
    /// unreachable.
    pub fn dest_abort(&self, addr: std::net::Ipv4Addr, reason: AbortReason) {
        for sock in self.socktab.sockets() {
            let mut inner = sock.inner.lock().unwrap();
            if inner.shutdown {
                continue;
            }
            let keys: Vec<RpcKey> = inner
                .active
                .iter()
                .copied()
                .filter(|k| k.is_client())
                .collect();
            for key in keys {
                let matches = matches!(
                    inner.rpc(key),
                    Some(rpc) if rpc.peer.addr == addr
                        && !matches!(rpc.state, RpcState::Ready | RpcState::ClientDone)
                );
                if matches {
                    self.rpc_abort(&sock, &mut inner, key, reason);
                }
            }
        }
        self.rebalance_grants();
    }

    /// Body of the timer worker thread.
    pub(crate) fn timer_main(&self) {
        while !self.exit.load(Ordering::Acquire) {
            std::thread::sleep(self.config.timer_interval.into());
            self.timer_tick();
        }
    }
}
