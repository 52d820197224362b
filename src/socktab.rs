use std::sync::{Arc, Mutex, RwLock};

use crate::socket::Socket;

/// Number of hash buckets; must be a power of 2. Client ports are
/// allocated sequentially and server ports are unpredictable, so the low
/// bits of the port distribute well on their own.
const BUCKETS: usize = 1024;

/// First port usable for clients; everything below is reserved for
/// explicitly bound servers.
pub const MIN_CLIENT_PORT: u16 = 0x8000;

#[inline]
fn port_hash(port: u16) -> usize {
    port as usize & (BUCKETS - 1)
}

/// Maps port numbers (client or server) to sockets.
///
/// Lookups happen on every received packet, so they take only a brief
/// read lock on the bucket array and hand out `Arc<Socket>` handles that
/// outlive it. Insertion, removal, and port allocation serialize on the
/// write half.
pub struct SockTab {
    buckets: RwLock<Vec<Vec<(u16, Arc<Socket>)>>>,
    /// The next client port to consider; increments monotonically and
    /// wraps within the client range. May name a port already in use;
    /// allocation checks before taking it.
    next_client_port: Mutex<u16>,
}

impl SockTab {
    pub fn new() -> SockTab {
        SockTab {
            buckets: RwLock::new(vec![Vec::new(); BUCKETS]),
            next_client_port: Mutex::new(MIN_CLIENT_PORT),
        }
    }

    /// Look up the socket owning `port`.
    pub fn find(&self, port: u16) -> Option<Arc<Socket>> {
        let buckets = self.buckets.read().unwrap();
        buckets[port_hash(port)]
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, sock)| sock.clone())
    }

    /// True if `port` is mapped.
    pub fn contains(&self, port: u16) -> bool {
        let buckets = self.buckets.read().unwrap();
        buckets[port_hash(port)].iter().any(|(p, _)| *p == port)
    }

    /// Map `port` to `sock`. Returns false if the port is taken.
    pub fn insert(&self, port: u16, sock: &Arc<Socket>) -> bool {
        let mut buckets = self.buckets.write().unwrap();
        let bucket = &mut buckets[port_hash(port)];
        if bucket.iter().any(|(p, _)| *p == port) {
            return false;
        }
        bucket.push((port, sock.clone()));
        true
    }

    /// Unmap `port`.
    pub fn remove(&self, port: u16) {
        let mut buckets = self.buckets.write().unwrap();
        buckets[port_hash(port)].retain(|(p, _)| *p != port);
    }

    /// Allocate a fresh client port for `sock` and map it.
    pub fn alloc_client_port(&self, sock: &Arc<Socket>) -> u16 {
        let mut next = self.next_client_port.lock().unwrap();
        loop {
            let port = *next;
            *next = if port == u16::MAX {
                MIN_CLIENT_PORT
            } else {
                port + 1
            };
            // Skip ports still held by an existing socket (the counter
            // may wrap into them) and the reserved server range.
            if port >= MIN_CLIENT_PORT && self.insert(port, sock) {
                return port;
            }
        }
    }

    /// Snapshot of every open socket, for the timer scan. A socket with
    /// a bound server port appears under two ports; deduplicate by
    /// pointer.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        let buckets = self.buckets.read().unwrap();
        let mut out: Vec<Arc<Socket>> = Vec::new();
        for bucket in buckets.iter() {
            for (_, sock) in bucket {
                if !out.iter().any(|s| Arc::ptr_eq(s, sock)) {
                    out.push(sock.clone());
                }
            }
        }
        out
    }
}

impl Default for SockTab {
    fn default() -> Self {
        SockTab::new()
    }
}
