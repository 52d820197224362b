/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   `Packet` family of structures, e.g. [DataPacket] or [GrantPacket].
 * Second, in cases where the space of valid field values is much smaller
   than the space of possible field values, it provides a compact,
   high-level representation of packet data that can be parsed from and
   emitted into a sequence of octets. This happens through the `Repr`
   family of structs, e.g. [GrantRepr] or [CutoffsRepr].

The `Packet` family of data structures guarantees that, if the
`Packet::check_len()` method returned `Ok(())`, then no accessor or setter
method will panic. The `Packet::new_checked` method is a shorthand for a
combination of `Packet::new_unchecked` and `Packet::check_len`; when
parsing untrusted input it is *necessary* to use `Packet::new_checked()`.

Every packet begins with a 28-byte common header whose first twelve bytes
and data-offset byte occupy the same positions as in a TCP header, so that
generic segmentation-offload hardware can process outbound DATA datagrams
as if they were TCP segments.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

pub(crate) mod common;
pub use self::common::{Packet as CommonPacket, HEADER_LEN as COMMON_HEADER_LEN};

pub(crate) mod data;
pub use self::data::{
    Packet as DataPacket, SegmentIter, HEADER_LEN as DATA_HEADER_LEN,
    PREFIX_LEN as DATA_PREFIX_LEN, SEG_DESC_LEN,
};

pub(crate) mod control;
pub use self::control::{
    BusyRepr, CutoffsPacket, CutoffsRepr, FreezeRepr, GrantPacket, GrantRepr, ResendPacket,
    ResendRepr, RestartRepr, CUTOFFS_HEADER_LEN, GRANT_HEADER_LEN, RESEND_HEADER_LEN,
};

/// Largest permissible message size, in bytes.
pub const MAX_MESSAGE_SIZE: u32 = 1_000_000;

/// Size of an IPv4 header.
pub const IPV4_HEADER_LEN: usize = 20;

/// Number of bytes per Ethernet packet for CRC, preamble, and
/// inter-packet gap; counted when estimating wire occupancy.
pub const ETH_OVERHEAD: usize = 24;

/// Largest allowable header. All packets must be at least as long as the
/// header for their type, and no header may exceed this.
pub const MAX_HEADER: usize = 64;

/// Maximum length of an Ethernet payload, excluding preamble, frame
/// delimiter, CRC, and inter-packet gap; all of this space is available
/// for IPv4 plus transport.
pub const ETHERNET_MAX_PAYLOAD: usize = 1500;

/// The total number of priority levels. Changing this value affects the
/// CUTOFFS packet format.
pub const NUM_PRIORITIES: usize = 8;

/// The most message payload a single wire segment can carry while its
/// datagram (DATA header with one descriptor, plus IPv4 header) still
/// fits a 1500-byte Ethernet payload.
pub const MAX_SEG_PAYLOAD: usize = ETHERNET_MAX_PAYLOAD - IPV4_HEADER_LEN - DATA_HEADER_LEN;

/// The error type for the wire layer: a packet too short for its type, a
/// length field inconsistent with the buffer, or a malformed segment
/// chain.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wire error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The possible kinds of packets.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacketType {
    Data,
    Grant,
    Resend,
    Restart,
    Busy,
    Cutoffs,
    Freeze,
    Unknown(u8),
}

mod opcode {
    pub const DATA: u8 = 20;
    pub const GRANT: u8 = 21;
    pub const RESEND: u8 = 22;
    pub const RESTART: u8 = 23;
    pub const BUSY: u8 = 24;
    pub const CUTOFFS: u8 = 25;
    pub const FREEZE: u8 = 26;
}

impl From<u8> for PacketType {
    fn from(value: u8) -> PacketType {
        match value {
            opcode::DATA => PacketType::Data,
            opcode::GRANT => PacketType::Grant,
            opcode::RESEND => PacketType::Resend,
            opcode::RESTART => PacketType::Restart,
            opcode::BUSY => PacketType::Busy,
            opcode::CUTOFFS => PacketType::Cutoffs,
            opcode::FREEZE => PacketType::Freeze,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> u8 {
        match value {
            PacketType::Data => opcode::DATA,
            PacketType::Grant => opcode::GRANT,
            PacketType::Resend => opcode::RESEND,
            PacketType::Restart => opcode::RESTART,
            PacketType::Busy => opcode::BUSY,
            PacketType::Cutoffs => opcode::CUTOFFS,
            PacketType::Freeze => opcode::FREEZE,
            PacketType::Unknown(other) => other,
        }
    }
}

impl PacketType {
    /// Index used by the per-type packet counters; `None` for unknown
    /// opcodes.
    pub fn metric_index(&self) -> Option<usize> {
        match self {
            PacketType::Data => Some(0),
            PacketType::Grant => Some(1),
            PacketType::Resend => Some(2),
            PacketType::Restart => Some(3),
            PacketType::Busy => Some(4),
            PacketType::Cutoffs => Some(5),
            PacketType::Freeze => Some(6),
            PacketType::Unknown(_) => None,
        }
    }

    pub const COUNT: usize = 7;
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketType::Data => write!(f, "DATA"),
            PacketType::Grant => write!(f, "GRANT"),
            PacketType::Resend => write!(f, "RESEND"),
            PacketType::Restart => write!(f, "RESTART"),
            PacketType::Busy => write!(f, "BUSY"),
            PacketType::Cutoffs => write!(f, "CUTOFFS"),
            PacketType::Freeze => write!(f, "FREEZE"),
            PacketType::Unknown(op) => write!(f, "UNKNOWN({op})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_round_trip() {
        for op in 20..=26u8 {
            let ty = PacketType::from(op);
            assert!(!matches!(ty, PacketType::Unknown(_)));
            assert_eq!(u8::from(ty), op);
        }
        assert_eq!(PacketType::from(19), PacketType::Unknown(19));
        assert_eq!(PacketType::from(27), PacketType::Unknown(27));
    }

    #[test]
    fn header_bounds() {
        assert!(COMMON_HEADER_LEN <= MAX_HEADER);
        assert!(DATA_HEADER_LEN <= MAX_HEADER);
        assert!(GRANT_HEADER_LEN <= MAX_HEADER);
        assert!(RESEND_HEADER_LEN <= MAX_HEADER);
        assert!(CUTOFFS_HEADER_LEN <= MAX_HEADER);
        // A full-size segment datagram exactly fills an Ethernet payload.
        assert_eq!(
            IPV4_HEADER_LEN + DATA_HEADER_LEN + MAX_SEG_PAYLOAD,
            ETHERNET_MAX_PAYLOAD
        );
    }
}
