use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Condvar, Mutex};

use crate::rpc::{AbortReason, Rpc, RpcKey, RpcState};
use crate::stack::Stack;

/// The error type for operations on the socket surface.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A nonblocking receive found nothing ready.
    WouldBlock,
    /// The socket has been shut down; in-flight operations are drained.
    Shutdown,
    /// A malformed request from the application: an oversized or empty
    /// message, a reply for an RPC not in service, or a bad bind port.
    InvalidArgument,
    /// No route to the destination host; no RPC was created.
    Route,
    /// An RPC failed; the failure is surfaced through the receive path
    /// exactly once.
    RpcAborted { id: u64, reason: AbortReason },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Shutdown => write!(f, "socket shut down"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Route => write!(f, "no route to peer"),
            Error::RpcAborted { id, reason } => {
                write!(f, "RPC {id} aborted: {reason:?}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Which message a completed RPC delivered.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageKind {
    /// A request received by a server; answer it with
    /// [`SocketHandle::reply`].
    Request,
    /// A response received by a client; the RPC is finished.
    Response,
}

/// A complete message delivered by [`SocketHandle::recv`].
#[derive(Debug)]
pub struct Message {
    /// The RPC id, chosen by the client.
    pub id: u64,
    /// The other endpoint: the client for a request, the server for a
    /// response.
    pub peer: SocketAddrV4,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Filters for [`SocketHandle::recv`].
#[derive(Debug, Clone, Copy)]
pub struct RecvFlags {
    /// Accept incoming requests (server side).
    pub request: bool,
    /// Accept incoming responses (client side).
    pub response: bool,
    /// Fail with [`Error::WouldBlock`] instead of sleeping.
    pub nonblocking: bool,
}

impl Default for RecvFlags {
    fn default() -> RecvFlags {
        RecvFlags {
            request: true,
            response: true,
            nonblocking: false,
        }
    }
}

/// An open socket: one client port, at most one bound server port, and
/// every RPC either side of it owns.
pub struct Socket {
    pub(crate) inner: Mutex<SocketInner>,
    /// Signalled whenever a ready queue gains an entry or the socket
    /// shuts down.
    pub(crate) ready: Condvar,
}

pub(crate) struct SocketInner {
    /// True means the socket is no longer usable.
    pub shutdown: bool,

    /// Port for receiving RPC requests; 0 until bound.
    pub server_port: u16,

    /// Port for issuing outgoing requests; always allocated.
    pub client_port: u16,

    /// Id for the next outgoing RPC; increments monotonically.
    pub next_outgoing_id: u64,

    /// Client RPCs by id.
    pub client_rpcs: HashMap<u64, Rpc>,

    /// Server RPCs by (client address, client port, id).
    pub server_rpcs: HashMap<(Ipv4Addr, u16, u64), Rpc>,

    /// Every live RPC, oldest first; walked by the timer so it need not
    /// scan the hash tables.
    pub active: Vec<RpcKey>,

    /// RPCs freed but not yet reaped; their frame buffers are released
    /// in batches by the timer.
    pub dead: Vec<Rpc>,

    /// Server RPCs in `Ready` state not yet claimed, oldest first.
    pub ready_requests: VecDeque<RpcKey>,

    /// Client RPCs in `Ready` state not yet claimed, oldest first.
    pub ready_responses: VecDeque<RpcKey>,

    /// Makes `recv` default to nonblocking; set through the socket
    /// options.
    pub default_nonblocking: bool,
}

impl Socket {
    pub(crate) fn new(client_port: u16) -> Socket {
        Socket {
            inner: Mutex::new(SocketInner {
                shutdown: false,
                server_port: 0,
                client_port,
                next_outgoing_id: 1,
                client_rpcs: HashMap::new(),
                server_rpcs: HashMap::new(),
                active: Vec::new(),
                dead: Vec::new(),
                ready_requests: VecDeque::new(),
                ready_responses: VecDeque::new(),
                default_nonblocking: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Receive one complete message, honoring `flags` and the optional
    /// id filter (which matches client RPCs only).
    pub(crate) fn recv(&self, flags: RecvFlags, id: Option<u64>) -> Result<Message> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return Err(Error::Shutdown);
            }
            if let Some(key) = inner.claim(flags, id) {
                return inner.deliver(key);
            }
            if flags.nonblocking {
                return Err(Error::WouldBlock);
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }
}

impl SocketInner {
    pub fn rpc(&self, key: RpcKey) -> Option<&Rpc> {
        match key {
            RpcKey::Client { id } => self.client_rpcs.get(&id),
            RpcKey::Server { addr, port, id } => self.server_rpcs.get(&(addr, port, id)),
        }
    }

    pub fn rpc_mut(&mut self, key: RpcKey) -> Option<&mut Rpc> {
        match key {
            RpcKey::Client { id } => self.client_rpcs.get_mut(&id),
            RpcKey::Server { addr, port, id } => self.server_rpcs.get_mut(&(addr, port, id)),
        }
    }

    /// Add a freshly created RPC to its table and the active list.
    pub fn insert_rpc(&mut self, rpc: Rpc) {
        let key = rpc.key;
        match key {
            RpcKey::Client { id } => {
                self.client_rpcs.insert(id, rpc);
            }
            RpcKey::Server { addr, port, id } => {
                self.server_rpcs.insert((addr, port, id), rpc);
            }
        }
        self.active.push(key);
    }

    /// Detach an RPC from its table, the active list, and the ready
    /// queues, returning the record.
    pub fn remove_rpc(&mut self, key: RpcKey) -> Option<Rpc> {
        let rpc = match key {
            RpcKey::Client { id } => self.client_rpcs.remove(&id),
            RpcKey::Server { addr, port, id } => self.server_rpcs.remove(&(addr, port, id)),
        };
        if rpc.is_some() {
            self.active.retain(|k| *k != key);
            self.ready_requests.retain(|k| *k != key);
            self.ready_responses.retain(|k| *k != key);
        }
        rpc
    }

    /// The local port that packets of this RPC carry as source.
    pub fn local_port(&self, key: RpcKey) -> u16 {
        if key.is_client() {
            self.client_port
        } else {
            self.server_port
        }
    }

    /// Queue a `Ready` RPC for the read path. The caller wakes the
    /// socket's condvar after releasing the lock.
    pub fn mark_ready(&mut self, key: RpcKey) {
        if key.is_client() {
            self.ready_responses.push_back(key);
        } else {
            self.ready_requests.push_back(key);
        }
    }

    /// Find a ready RPC matching the filters, if any.
    fn claim(&mut self, flags: RecvFlags, id: Option<u64>) -> Option<RpcKey> {
        if let Some(id) = id {
            let key = RpcKey::Client { id };
            if matches!(self.rpc(key), Some(rpc) if rpc.state == RpcState::Ready) {
                self.ready_responses.retain(|k| *k != key);
                return Some(key);
            }
            return None;
        }
        if flags.request {
            // Entries can go stale when a socket shuts down mid-wait;
            // skip them.
            while let Some(key) = self.ready_requests.pop_front() {
                if matches!(self.rpc(key), Some(rpc) if rpc.state == RpcState::Ready) {
                    return Some(key);
                }
            }
        }
        if flags.response {
            while let Some(key) = self.ready_responses.pop_front() {
                if matches!(self.rpc(key), Some(rpc) if rpc.state == RpcState::Ready) {
                    return Some(key);
                }
            }
        }
        None
    }

    /// Consume a claimed `Ready` RPC: surface its error or hand its
    /// message to the application and advance the state machine.
    fn deliver(&mut self, key: RpcKey) -> Result<Message> {
        let rpc = match self.rpc_mut(key) {
            Some(rpc) => rpc,
            None => return Err(Error::WouldBlock),
        };
        if let Some(reason) = rpc.error {
            let id = rpc.id();
            if let Some(rpc) = self.remove_rpc(key) {
                self.dead.push(rpc);
            }
            return Err(Error::RpcAborted { id, reason });
        }
        let payload = match rpc.msgin.as_ref() {
            Some(msgin) => msgin.copy_out(),
            None => Vec::new(),
        };
        let id = rpc.id();
        match key {
            RpcKey::Client { .. } => {
                let peer = SocketAddrV4::new(rpc.peer.addr, rpc.dport);
                rpc.state = RpcState::ClientDone;
                if let Some(rpc) = self.remove_rpc(key) {
                    self.dead.push(rpc);
                }
                Ok(Message {
                    id,
                    peer,
                    kind: MessageKind::Response,
                    payload,
                })
            }
            RpcKey::Server { addr, port, .. } => {
                rpc.state = RpcState::InService;
                // The request bytes have been handed over; drop the
                // reassembly state now rather than at destruction.
                rpc.msgin = None;
                Ok(Message {
                    id,
                    peer: SocketAddrV4::new(addr, port),
                    kind: MessageKind::Request,
                    payload,
                })
            }
        }
    }
}

/// An application's handle to an open socket.
///
/// Cloning the handle does not duplicate the socket; all clones share
/// the same ports and queues.
#[derive(Clone)]
pub struct SocketHandle {
    pub(crate) stack: Arc<Stack>,
    pub(crate) sock: Arc<Socket>,
}

impl SocketHandle {
    /// Assign a server port so this socket can receive requests.
    pub fn bind(&self, port: u16) -> Result<()> {
        self.stack.bind(&self.sock, port)
    }

    /// Start a new RPC: transmit `payload` to `dest` and return the RPC
    /// id, which a later [`recv`](Self::recv) call will deliver the
    /// response under.
    pub fn send(&self, dest: SocketAddrV4, payload: &[u8]) -> Result<u64> {
        self.stack.send(&self.sock, dest, payload)
    }

    /// Answer a request previously received from `peer` with the given
    /// id.
    pub fn reply(&self, peer: SocketAddrV4, id: u64, payload: &[u8]) -> Result<()> {
        self.stack.reply(&self.sock, peer, id, payload)
    }

    /// Receive the next complete message, blocking unless the socket
    /// default or `flags` say otherwise.
    pub fn recv(&self, mut flags: RecvFlags) -> Result<Message> {
        flags.nonblocking |= self.nonblocking();
        self.sock.recv(flags, None)
    }

    /// Receive the response for one specific RPC id.
    pub fn recv_response(&self, id: u64, mut flags: RecvFlags) -> Result<Message> {
        flags.nonblocking |= self.nonblocking();
        self.sock.recv(flags, Some(id))
    }

    /// True if a `recv` would find something ready right now.
    pub fn poll(&self) -> bool {
        let inner = self.sock.inner.lock().unwrap();
        inner.shutdown
            || !inner.ready_requests.is_empty()
            || !inner.ready_responses.is_empty()
    }

    /// Make every `recv` on this socket default to nonblocking.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.sock.inner.lock().unwrap().default_nonblocking = nonblocking;
    }

    /// The current default-nonblocking setting.
    pub fn nonblocking(&self) -> bool {
        self.sock.inner.lock().unwrap().default_nonblocking
    }

    /// The client port allocated to this socket.
    pub fn client_port(&self) -> u16 {
        self.sock.inner.lock().unwrap().client_port
    }

    /// The bound server port, or 0.
    pub fn server_port(&self) -> u16 {
        self.sock.inner.lock().unwrap().server_port
    }

    /// Disable the socket: in-flight RPCs are dropped and blocked
    /// readers wake with [`Error::Shutdown`]. The handle itself stays
    /// valid; further operations fail.
    pub fn shutdown(&self) {
        self.stack.close_socket(&self.sock);
    }

    /// Shut the socket down and release its ports.
    pub fn close(&self) {
        self.stack.close_socket(&self.sock);
    }
}
