/*! A low-latency datacenter RPC transport engine carried directly over
IPv4 datagrams.

The engine delivers discrete request/response messages (RPCs) in place of
TCP streams. Three subsystems do the heavy lifting:

 * The **RPC state machine** tracks each message's send and receive
   progress: outgoing frames, incoming segments with holes, retransmission
   and timeouts.
 * The **grant scheduler** is the receiver-driven flow-control engine. It
   ranks concurrent incoming messages by bytes remaining (shortest
   remaining first) and authorizes senders with GRANT packets, bounded by
   an overcommit budget.
 * The **output pacer** keeps the NIC transmit queue at a target occupancy
   measured in time, draining throttled RPCs from a dedicated worker.

Above the engine sits a socket-like surface ([`Stack::open`],
[`SocketHandle`]); below it sits a raw IP datagram device
([`phy::Device`]). Packet formats live in [`wire`].
*/

#[macro_use]
mod macros;

pub mod phy;
pub mod time;
pub mod wire;

mod config;
mod grant;
mod incoming;
mod metrics;
mod outgoing;
mod pacer;
mod peer;
mod rpc;
mod socket;
mod socktab;
mod stack;
mod timer;

pub use self::config::Config;
pub use self::rpc::AbortReason;
pub use self::socket::{Error, Message, MessageKind, RecvFlags, Result, SocketHandle};
pub use self::stack::Stack;
