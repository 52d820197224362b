use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{common, Error, Result};

/// A read/write wrapper around a DATA packet buffer.
///
/// A DATA buffer holds a fixed prefix (the common header plus the
/// message length, incoming watermark, cutoff version, and retransmit
/// flag) followed by one or more `(offset, segment length, payload)`
/// triples. A single buffer can hold several triples so that send and
/// receive offload can carry many network packets of data in one
/// traversal of the host stack; the NIC splits such a buffer into one
/// datagram per triple.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const MESSAGE_LENGTH: Field = 28..32;
    pub const INCOMING: Field = 32..36;
    pub const CUTOFF_VERSION: Field = 36..38;
    pub const RETRANSMIT: usize = 38;
    pub const PAD: usize = 39;
    pub const SEGMENTS: Rest = 40..;
}

/// Length of the fixed prefix preceding the segment triples.
pub const PREFIX_LEN: usize = field::SEGMENTS.start;

/// Length of one segment descriptor (offset plus segment length).
pub const SEG_DESC_LEN: usize = 8;

/// Minimum length of a DATA packet: the prefix plus the first segment's
/// descriptor.
pub const HEADER_LEN: usize = PREFIX_LEN + SEG_DESC_LEN;

/// The data-offset byte carried by every DATA packet: the prefix size in
/// 4-byte chunks, positioned as a TCP data offset.
pub const DOFF: u8 = ((PREFIX_LEN / 4) as u8) << 4;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with DATA packet structure.
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

    /// Ensure that no accessor method will panic if called, and that the
    /// segment chain is well formed: every descriptor complete, every
    /// payload within the buffer, at least one segment present.
    pub fn check_len(&self) -> Result<()> {
        let data = self.buffer.as_ref();
        if data.len() < HEADER_LEN {
            return Err(Error);
        }
        let mut at = PREFIX_LEN;
        let mut segments = 0;
        while at < data.len() {
            if data.len() - at < SEG_DESC_LEN {
                return Err(Error);
            }
            let seg_len = NetworkEndian::read_u32(&data[at + 4..at + 8]) as usize;
            at += SEG_DESC_LEN;
            if data.len() - at < seg_len {
                return Err(Error);
            }
            at += seg_len;
            segments += 1;
        }
        if segments == 0 {
            return Err(Error);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the total number of bytes in the *message* (not in this
    /// packet).
    #[inline]
    pub fn message_length(&self) -> u32 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u32(&data[field::MESSAGE_LENGTH])
    }

    /// Return the incoming watermark: the receiver can expect the sender
    /// to transmit all message bytes up to this offset (exclusive) even
    /// without additional grants.
    #[inline]
    pub fn incoming(&self) -> u32 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u32(&data[field::INCOMING])
    }

    /// Return the cutoff version from the most recent CUTOFFS packet the
    /// source of this packet has received from its destination; 0 if it
    /// has never received one.
    #[inline]
    pub fn cutoff_version(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CUTOFF_VERSION])
    }

    /// Return whether this packet was sent in response to a RESEND.
    #[inline]
    pub fn retransmit(&self) -> bool {
        self.buffer.as_ref()[field::RETRANSMIT] != 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return an iterator over the `(offset, payload)` segments in this
    /// packet. Call only after a successful [Packet::check_len].
    pub fn segments(&self) -> SegmentIter<'a> {
        SegmentIter {
            data: &self.buffer.as_ref()[field::SEGMENTS.start..],
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the message length field.
    #[inline]
    pub fn set_message_length(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::MESSAGE_LENGTH], value)
    }

    /// Set the incoming watermark field.
    #[inline]
    pub fn set_incoming(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::INCOMING], value)
    }

    /// Set the cutoff version field.
    #[inline]
    pub fn set_cutoff_version(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CUTOFF_VERSION], value)
    }

    /// Set the retransmit flag.
    #[inline]
    pub fn set_retransmit(&mut self, value: bool) {
        self.buffer.as_mut()[field::RETRANSMIT] = value as u8;
        self.buffer.as_mut()[field::PAD] = 0;
    }

    /// Write the segment descriptor and payload at byte position `at`
    /// within the segment region, returning the position just past the
    /// written segment. Positions start at 0 for the first segment.
    pub fn emit_segment(&mut self, at: usize, offset: u32, payload: &[u8]) -> usize {
        let data = self.buffer.as_mut();
        let base = field::SEGMENTS.start + at;
        NetworkEndian::write_u32(&mut data[base..base + 4], offset);
        NetworkEndian::write_u32(&mut data[base + 4..base + 8], payload.len() as u32);
        data[base + SEG_DESC_LEN..base + SEG_DESC_LEN + payload.len()].copy_from_slice(payload);
        at + SEG_DESC_LEN + payload.len()
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// The exact buffer size needed for a DATA packet carrying segments with
/// the given payload lengths.
pub fn buffer_len(payload_lens: &[usize]) -> usize {
    PREFIX_LEN + payload_lens.iter().map(|l| SEG_DESC_LEN + l).sum::<usize>()
}

/// An iterator over the segments of a DATA packet.
#[derive(Debug, Clone)]
pub struct SegmentIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<(u32, &'a [u8])> {
        if self.data.len() < SEG_DESC_LEN {
            return None;
        }
        let offset = NetworkEndian::read_u32(&self.data[0..4]);
        let seg_len = NetworkEndian::read_u32(&self.data[4..8]) as usize;
        if self.data.len() - SEG_DESC_LEN < seg_len {
            self.data = &[];
            return None;
        }
        let payload = &self.data[SEG_DESC_LEN..SEG_DESC_LEN + seg_len];
        self.data = &self.data[SEG_DESC_LEN + seg_len..];
        Some((offset, payload))
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let common = common::Packet::new_unchecked(self.buffer.as_ref());
        write!(
            f,
            "{} length={} incoming={} retransmit={}",
            common,
            self.message_length(),
            self.incoming(),
            self.retransmit() as u8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CommonPacket, PacketType};

    fn build(segs: &[(u32, &[u8])]) -> Vec<u8> {
        let lens: Vec<usize> = segs.iter().map(|(_, p)| p.len()).collect();
        let mut buffer = vec![0u8; buffer_len(&lens)];
        let mut common = CommonPacket::new_unchecked(&mut buffer[..]);
        common.set_src_port(40000);
        common.set_dst_port(99);
        common.set_packet_type(PacketType::Data);
        common.set_id(7);
        common.set_doff(DOFF);
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        packet.set_message_length(10_000);
        packet.set_incoming(2_864);
        packet.set_cutoff_version(3);
        packet.set_retransmit(false);
        let mut at = 0;
        for (offset, payload) in segs {
            at = packet.emit_segment(at, *offset, payload);
        }
        buffer
    }

    #[test]
    fn single_segment_round_trip() {
        let payload = vec![0xa5u8; 100];
        let buffer = build(&[(1432, &payload)]);
        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.message_length(), 10_000);
        assert_eq!(packet.incoming(), 2_864);
        assert_eq!(packet.cutoff_version(), 3);
        assert!(!packet.retransmit());
        let segs: Vec<_> = packet.segments().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, 1432);
        assert_eq!(segs[0].1, &payload[..]);
    }

    #[test]
    fn offload_batch_carries_many_segments() {
        let a = vec![1u8; 1432];
        let b = vec![2u8; 1432];
        let c = vec![3u8; 136];
        let buffer = build(&[(0, &a), (1432, &b), (2864, &c)]);
        let packet = Packet::new_checked(&buffer[..]).unwrap();
        let segs: Vec<_> = packet.segments().collect();
        assert_eq!(
            segs.iter().map(|(o, p)| (*o, p.len())).collect::<Vec<_>>(),
            vec![(0, 1432), (1432, 1432), (2864, 136)]
        );
    }

    #[test]
    fn truncated_segment_rejected() {
        let payload = vec![0u8; 64];
        let mut buffer = build(&[(0, &payload)]);
        buffer.truncate(buffer.len() - 1);
        assert_eq!(Packet::new_checked(&buffer[..]), Err(Error));
    }

    #[test]
    fn descriptorless_packet_rejected() {
        let buffer = vec![0u8; PREFIX_LEN];
        assert_eq!(Packet::new_checked(&buffer[..]), Err(Error));
    }

    #[test]
    fn doff_counts_prefix_chunks() {
        // Ten 4-byte chunks of prefix, encoded in the high nibble the way
        // a TCP data offset is.
        assert_eq!(DOFF, 0xa0);
    }
}
