use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, PacketType, Result};

/// A read/write wrapper around the common header shared by every packet
/// type.
///
/// The source port, destination port, and data-offset byte sit at the
/// same offsets as in a TCP header, so segmentation-offload hardware can
/// treat outbound DATA datagrams as TCP segments. The sequence-number,
/// checksum, and window positions are present but unused; offload
/// engines may scribble on them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const UNUSED1: Field = 4..8;
    pub const UNUSED2: Field = 8..12;
    pub const DOFF: usize = 12;
    pub const TYPE: usize = 13;
    pub const UNUSED3: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const UNUSED4: Field = 18..20;
    pub const ID: Field = 20..28;
}

pub const HEADER_LEN: usize = field::ID.end;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with common-header structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the common
    /// header.
    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the data-offset byte.
    #[inline]
    pub fn doff(&self) -> u8 {
        self.buffer.as_ref()[field::DOFF]
    }

    /// Return the packet type.
    #[inline]
    pub fn packet_type(&self) -> PacketType {
        PacketType::from(self.buffer.as_ref()[field::TYPE])
    }

    /// Return the RPC identifier. Unique among all RPCs issued from the
    /// client port; transmitted in network byte order.
    #[inline]
    pub fn id(&self) -> u64 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u64(&data[field::ID])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the data-offset byte.
    #[inline]
    pub fn set_doff(&mut self, value: u8) {
        self.buffer.as_mut()[field::DOFF] = value
    }

    /// Set the packet type.
    #[inline]
    pub fn set_packet_type(&mut self, value: PacketType) {
        self.buffer.as_mut()[field::TYPE] = value.into()
    }

    /// Set the RPC identifier.
    #[inline]
    pub fn set_id(&mut self, value: u64) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u64(&mut data[field::ID], value)
    }

    /// Zero the unused and checksum fields so reused buffers never leak
    /// stale bytes into positions offload hardware may read.
    pub fn clear_unused(&mut self) {
        let data = self.buffer.as_mut();
        data[field::UNUSED1].fill(0);
        data[field::UNUSED2].fill(0);
        data[field::UNUSED3].fill(0);
        data[field::CHECKSUM].fill(0);
        data[field::UNUSED4].fill(0);
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} id={} src={} dst={}",
            self.packet_type(),
            self.id(),
            self.src_port(),
            self.dst_port()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_positions_shadow_tcp() {
        // Ports in the first four bytes, doff at byte 12: the positions
        // segmentation offload expects of a TCP header.
        assert_eq!(field::SRC_PORT, 0..2);
        assert_eq!(field::DST_PORT, 2..4);
        assert_eq!(field::DOFF, 12);
        assert_eq!(HEADER_LEN, 28);
    }

    #[test]
    fn accessors_round_trip() {
        let mut buffer = [0u8; HEADER_LEN];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        packet.set_src_port(40001);
        packet.set_dst_port(500);
        packet.set_packet_type(PacketType::Grant);
        packet.set_id(0xdead_beef_0110);
        packet.clear_unused();

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.src_port(), 40001);
        assert_eq!(packet.dst_port(), 500);
        assert_eq!(packet.packet_type(), PacketType::Grant);
        assert_eq!(packet.id(), 0xdead_beef_0110);
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(Packet::new_checked(&[0u8; HEADER_LEN - 1][..]), Err(Error));
    }
}
