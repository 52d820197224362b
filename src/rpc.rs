use core::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::incoming::InMessage;
use crate::outgoing::OutMessage;
use crate::peer::Peer;

/// The lifecycle state of an RPC.
///
/// Client RPCs pass through states in the order
/// `Outgoing → Incoming → Ready → ClientDone`;
/// server RPCs in the order
/// `Incoming → Ready → InService → Outgoing` (then destruction once the
/// response is fully transmitted).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RpcState {
    /// The outgoing message (client request, or server response) is
    /// being transmitted to the peer.
    Outgoing,
    /// The incoming message is being received; at least one packet has
    /// arrived.
    Incoming,
    /// The incoming message is complete (or the RPC has failed); the
    /// next step is for the application to read it.
    Ready,
    /// Server only: the request has been read by the application, the
    /// response has not yet been handed back.
    InService,
    /// Client only: set when the response has been consumed, immediately
    /// before the record is reaped.
    ClientDone,
}

impl fmt::Display for RpcState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcState::Outgoing => write!(f, "OUTGOING"),
            RpcState::Incoming => write!(f, "INCOMING"),
            RpcState::Ready => write!(f, "READY"),
            RpcState::InService => write!(f, "IN_SERVICE"),
            RpcState::ClientDone => write!(f, "CLIENT_DONE"),
        }
    }
}

/// Why an RPC was aborted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AbortReason {
    /// The peer stopped responding: the resend budget was exhausted
    /// without progress.
    Timeout,
    /// The peer was declared crashed or unreachable.
    PeerCrash,
    /// The owning socket was shut down with the RPC still in flight.
    Reset,
}

/// Identifies an RPC within its owning socket.
///
/// The 64-bit id is chosen by the client and unique among RPCs from that
/// client port, so a client RPC needs only the id. A server can talk to
/// many clients that choose ids independently, so server RPCs are keyed
/// by the client's address and port as well.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RpcKey {
    Client { id: u64 },
    Server { addr: Ipv4Addr, port: u16, id: u64 },
}

impl RpcKey {
    pub fn id(&self) -> u64 {
        match self {
            RpcKey::Client { id } => *id,
            RpcKey::Server { id, .. } => *id,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, RpcKey::Client { .. })
    }
}

/// One in-flight RPC, on either endpoint.
///
/// The record and everything inside it are guarded by the owning
/// socket's lock; RPCs are not independently lockable. Global queues
/// (grantable, throttled) store `(socket, key)` handles and re-validate
/// against this record after reacquiring the socket lock.
pub struct Rpc {
    pub key: RpcKey,

    /// The other machine: the server for a client RPC, the client for a
    /// server RPC.
    pub peer: Arc<Peer>,

    /// Port on the peer that handles packets of this RPC.
    pub dport: u16,

    pub state: RpcState,

    /// Client only: a failed RPC parks its abort reason here and goes
    /// `Ready` so the next reader observes the failure.
    pub error: Option<AbortReason>,

    /// The message this machine is sending, when one exists.
    pub msgout: Option<OutMessage>,

    /// The message this machine is receiving, when one exists.
    pub msgin: Option<InMessage>,

    /// Timer ticks since a packet last arrived from the peer for this
    /// RPC; local transmissions do not reset it.
    pub silent_ticks: u32,

    /// RESENDs issued since the last packet arrived from the peer.
    pub num_resends: u32,

    /// True means this RPC may be linked into the grant queue, so
    /// cleanup must check (and take the grant lock). False means it
    /// cannot possibly be there.
    pub possibly_in_grant_queue: bool,

    /// True while the RPC sits on the throttle queue awaiting the pacer.
    pub throttled: bool,
}

impl Rpc {
    /// Create a client RPC about to transmit a request.
    pub fn new_client(key: RpcKey, peer: Arc<Peer>, dport: u16) -> Rpc {
        Rpc {
            key,
            peer,
            dport,
            state: RpcState::Outgoing,
            error: None,
            msgout: None,
            msgin: None,
            silent_ticks: 0,
            num_resends: 0,
            possibly_in_grant_queue: false,
            throttled: false,
        }
    }

    /// Create a server RPC for the first DATA packet of a new request.
    /// `dport` is the client's port, where grants and the response go.
    pub fn new_server(key: RpcKey, peer: Arc<Peer>, dport: u16, msgin: InMessage) -> Rpc {
        Rpc {
            key,
            peer,
            dport,
            state: RpcState::Incoming,
            error: None,
            msgout: None,
            msgin: Some(msgin),
            silent_ticks: 0,
            num_resends: 0,
            possibly_in_grant_queue: false,
            throttled: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.key.id()
    }

    pub fn is_client(&self) -> bool {
        self.key.is_client()
    }

    /// Note that a packet arrived from the peer: the RPC is no longer
    /// silent and the resend budget starts over.
    pub fn note_progress(&mut self) {
        self.silent_ticks = 0;
        self.num_resends = 0;
    }

    /// True if this RPC is waiting on the peer for message data: either
    /// side while its incoming message is incomplete, or a client whose
    /// request is fully transmitted and whose response has not begun.
    /// A sender still working through its own message (or stalled on
    /// grants) is owed grants, not data.
    pub fn awaiting_data(&self) -> bool {
        match self.state {
            RpcState::Incoming => true,
            RpcState::Outgoing => {
                self.is_client() && self.msgout.as_ref().is_some_and(|m| m.fully_sent())
            }
            _ => false,
        }
    }
}
