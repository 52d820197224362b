use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{common, Error, PacketType, Result, NUM_PRIORITIES};

/// A read/write wrapper around a GRANT packet buffer.
///
/// GRANTs flow from the receiver of a message back to its sender,
/// authorizing transmission of all data up to (but not including) the
/// carried offset, at the carried priority.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GrantPacket<T: AsRef<[u8]>> {
    buffer: T,
}

mod grant_field {
    use crate::wire::field::*;

    pub const OFFSET: Field = 28..32;
    pub const PRIORITY: usize = 32;
}

pub const GRANT_HEADER_LEN: usize = grant_field::PRIORITY + 1;

impl<T: AsRef<[u8]>> GrantPacket<T> {
    pub const fn new_unchecked(buffer: T) -> GrantPacket<T> {
        GrantPacket { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<GrantPacket<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < GRANT_HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Return the granted offset: the sender should now transmit all
    /// data up to (but not including) this offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[grant_field::OFFSET])
    }

    /// Return the priority the sender should use for future scheduled
    /// packets of this message.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.buffer.as_ref()[grant_field::PRIORITY]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> GrantPacket<T> {
    #[inline]
    pub fn set_offset(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[grant_field::OFFSET], value)
    }

    #[inline]
    pub fn set_priority(&mut self, value: u8) {
        self.buffer.as_mut()[grant_field::PRIORITY] = value
    }
}

/// A high-level representation of a GRANT packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct GrantRepr {
    pub offset: u32,
    pub priority: u8,
}

impl GrantRepr {
    pub fn parse<T: AsRef<[u8]>>(packet: &GrantPacket<T>) -> Result<GrantRepr> {
        packet.check_len()?;
        Ok(GrantRepr {
            offset: packet.offset(),
            priority: packet.priority(),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        GRANT_HEADER_LEN
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut GrantPacket<T>) {
        packet.set_offset(self.offset);
        packet.set_priority(self.priority);
    }
}

impl fmt::Display for GrantRepr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GRANT offset={} priority={}", self.offset, self.priority)
    }
}

/// A read/write wrapper around a RESEND packet buffer.
///
/// A RESEND is sent by a receiver that believes message data was lost in
/// transit (or that the sender may have crashed). The sender should
/// retransmit the named byte range even if it was sent before; the range
/// may extend past the end of the message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResendPacket<T: AsRef<[u8]>> {
    buffer: T,
}

mod resend_field {
    use crate::wire::field::*;

    pub const OFFSET: Field = 28..32;
    pub const LENGTH: Field = 32..36;
    pub const PRIORITY: usize = 36;
}

pub const RESEND_HEADER_LEN: usize = resend_field::PRIORITY + 1;

impl<T: AsRef<[u8]>> ResendPacket<T> {
    pub const fn new_unchecked(buffer: T) -> ResendPacket<T> {
        ResendPacket { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<ResendPacket<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < RESEND_HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Return the offset of the first byte to retransmit.
    #[inline]
    pub fn offset(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[resend_field::OFFSET])
    }

    /// Return the number of bytes to retransmit.
    #[inline]
    pub fn length(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[resend_field::LENGTH])
    }

    /// Return the priority the retransmitted data should use.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.buffer.as_ref()[resend_field::PRIORITY]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ResendPacket<T> {
    #[inline]
    pub fn set_offset(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[resend_field::OFFSET], value)
    }

    #[inline]
    pub fn set_length(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[resend_field::LENGTH], value)
    }

    #[inline]
    pub fn set_priority(&mut self, value: u8) {
        self.buffer.as_mut()[resend_field::PRIORITY] = value
    }
}

/// A high-level representation of a RESEND packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ResendRepr {
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

impl ResendRepr {
    pub fn parse<T: AsRef<[u8]>>(packet: &ResendPacket<T>) -> Result<ResendRepr> {
        packet.check_len()?;
        Ok(ResendRepr {
            offset: packet.offset(),
            length: packet.length(),
            priority: packet.priority(),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        RESEND_HEADER_LEN
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut ResendPacket<T>) {
        packet.set_offset(self.offset);
        packet.set_length(self.length);
        packet.set_priority(self.priority);
    }
}

impl fmt::Display for ResendRepr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RESEND offset={} length={} priority={}",
            self.offset, self.length, self.priority
        )
    }
}

/// A read/write wrapper around a CUTOFFS packet buffer.
///
/// CUTOFFS packets tell the recipient how to assign priorities to
/// unscheduled packets sent back to this host: entry `i` is the largest
/// message size that may use priority `i` (larger `i` is higher
/// priority).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CutoffsPacket<T: AsRef<[u8]>> {
    buffer: T,
}

mod cutoffs_field {
    use crate::wire::field::*;
    use crate::wire::NUM_PRIORITIES;

    pub const CUTOFFS: Field = 28..28 + 4 * NUM_PRIORITIES;
    pub const VERSION: Field = CUTOFFS.end..CUTOFFS.end + 2;
}

pub const CUTOFFS_HEADER_LEN: usize = cutoffs_field::VERSION.end;

impl<T: AsRef<[u8]>> CutoffsPacket<T> {
    pub const fn new_unchecked(buffer: T) -> CutoffsPacket<T> {
        CutoffsPacket { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<CutoffsPacket<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < CUTOFFS_HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Return the cutoff for priority level `index`.
    #[inline]
    pub fn cutoff(&self, index: usize) -> u32 {
        let base = cutoffs_field::CUTOFFS.start + 4 * index;
        NetworkEndian::read_u32(&self.buffer.as_ref()[base..base + 4])
    }

    /// Return the version identifying this set of cutoffs; echoed in
    /// future DATA packets to the sender of this packet.
    #[inline]
    pub fn version(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[cutoffs_field::VERSION])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> CutoffsPacket<T> {
    #[inline]
    pub fn set_cutoff(&mut self, index: usize, value: u32) {
        let base = cutoffs_field::CUTOFFS.start + 4 * index;
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[base..base + 4], value)
    }

    #[inline]
    pub fn set_version(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[cutoffs_field::VERSION], value)
    }
}

/// A high-level representation of a CUTOFFS packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CutoffsRepr {
    pub cutoffs: [u32; NUM_PRIORITIES],
    pub version: u16,
}

impl CutoffsRepr {
    pub fn parse<T: AsRef<[u8]>>(packet: &CutoffsPacket<T>) -> Result<CutoffsRepr> {
        packet.check_len()?;
        let mut cutoffs = [0u32; NUM_PRIORITIES];
        for (i, c) in cutoffs.iter_mut().enumerate() {
            *c = packet.cutoff(i);
        }
        Ok(CutoffsRepr {
            cutoffs,
            version: packet.version(),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        CUTOFFS_HEADER_LEN
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut CutoffsPacket<T>) {
        for (i, c) in self.cutoffs.iter().enumerate() {
            packet.set_cutoff(i, *c);
        }
        packet.set_version(self.version);
    }
}

/// RESTART, BUSY, and FREEZE packets carry nothing beyond the common
/// header. A RESTART tells a client that the server knows nothing of the
/// RPC it asked about, so the client should start over from offset zero
/// (the RPC may then execute more than once on the server, which the
/// protocol explicitly allows). A BUSY only proves the sender is alive.
/// A FREEZE stops the recipient's diagnostic trace buffer.
macro_rules! common_only_repr {
    ($(#[$attr:meta])* $name:ident, $ty:expr) => {
        $(#[$attr])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
        pub struct $name;

        impl $name {
            pub const fn buffer_len(&self) -> usize {
                common::HEADER_LEN
            }

            pub const fn packet_type(&self) -> PacketType {
                $ty
            }
        }
    };
}

common_only_repr!(RestartRepr, PacketType::Restart);
common_only_repr!(BusyRepr, PacketType::Busy);
common_only_repr!(FreezeRepr, PacketType::Freeze);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_round_trip() {
        let repr = GrantRepr {
            offset: 40_000,
            priority: 3,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        repr.emit(&mut GrantPacket::new_unchecked(&mut buffer[..]));
        let parsed = GrantRepr::parse(&GrantPacket::new_checked(&buffer[..]).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn resend_round_trip() {
        let repr = ResendRepr {
            offset: 20_000,
            length: 1_000,
            priority: 7,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        repr.emit(&mut ResendPacket::new_unchecked(&mut buffer[..]));
        let parsed = ResendRepr::parse(&ResendPacket::new_checked(&buffer[..]).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn cutoffs_round_trip() {
        let mut cutoffs = [u32::MAX; NUM_PRIORITIES];
        cutoffs[7] = 200;
        cutoffs[6] = 2_800;
        let repr = CutoffsRepr {
            cutoffs,
            version: 12,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        repr.emit(&mut CutoffsPacket::new_unchecked(&mut buffer[..]));
        let parsed = CutoffsRepr::parse(&CutoffsPacket::new_checked(&buffer[..]).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn short_control_packets_rejected() {
        assert!(GrantPacket::new_checked(&[0u8; GRANT_HEADER_LEN - 1][..]).is_err());
        assert!(ResendPacket::new_checked(&[0u8; RESEND_HEADER_LEN - 1][..]).is_err());
        assert!(CutoffsPacket::new_checked(&[0u8; CUTOFFS_HEADER_LEN - 1][..]).is_err());
    }
}
