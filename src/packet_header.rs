use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

/// Maximum encoded size of a packet header: prefix byte, sequence, two-byte ack and all
///  four ack-bits octets.
pub const MAX_PACKET_HEADER_BYTES: usize = 9;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    struct Prefix: u8 {
        /// set on fragment datagrams, clear on regular packets
        const FRAGMENT       = 0b0000_0001;
        /// ack-bits octet 0 (LSB) is present; absent octets default to 0xFF
        const ACK_BITS_BYTE0 = 0b0000_0010;
        const ACK_BITS_BYTE1 = 0b0000_0100;
        const ACK_BITS_BYTE2 = 0b0000_1000;
        const ACK_BITS_BYTE3 = 0b0001_0000;
        /// `ack` is encoded as a one-byte delta below `sequence` instead of a two-byte value
        const ACK_DELTA      = 0b0010_0000;
    }
}

/// The header prepended to every regular packet: the packet's sequence number plus the
///  piggybacked acknowledgement of up to the 33 most recently received sequences.
///
/// The encoding is variable-length: ack-bits octets that are all-ones are omitted (under
///  low loss that is most of them), and the ack is stored as a single-byte delta whenever
///  it trails the sequence number by at most 255. The prefix byte records which optional
///  parts are present. All multi-byte values are little-endian.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
}

impl PacketHeader {
    fn prefix(&self) -> Prefix {
        let mut prefix = Prefix::empty();
        if self.ack_bits & 0x0000_00FF != 0x0000_00FF {
            prefix |= Prefix::ACK_BITS_BYTE0;
        }
        if self.ack_bits & 0x0000_FF00 != 0x0000_FF00 {
            prefix |= Prefix::ACK_BITS_BYTE1;
        }
        if self.ack_bits & 0x00FF_0000 != 0x00FF_0000 {
            prefix |= Prefix::ACK_BITS_BYTE2;
        }
        if self.ack_bits & 0xFF00_0000 != 0xFF00_0000 {
            prefix |= Prefix::ACK_BITS_BYTE3;
        }
        if self.sequence.wrapping_sub(self.ack) <= 255 {
            prefix |= Prefix::ACK_DELTA;
        }
        prefix
    }

    /// The number of bytes `ser` writes for this header.
    pub fn serialized_len(&self) -> usize {
        let prefix = self.prefix();
        let ack_len = if prefix.contains(Prefix::ACK_DELTA) { 1 } else { 2 };
        let ack_bits_len = (prefix & (Prefix::ACK_BITS_BYTE0 | Prefix::ACK_BITS_BYTE1 | Prefix::ACK_BITS_BYTE2 | Prefix::ACK_BITS_BYTE3))
            .bits()
            .count_ones() as usize;
        1 + 2 + ack_len + ack_bits_len
    }

    /// Writes the header, returning the number of bytes written (at most
    ///  [`MAX_PACKET_HEADER_BYTES`]).
    pub fn ser(&self, buf: &mut impl BufMut) -> usize {
        let prefix = self.prefix();

        buf.put_u8(prefix.bits());
        buf.put_u16_le(self.sequence);

        if prefix.contains(Prefix::ACK_DELTA) {
            buf.put_u8(self.sequence.wrapping_sub(self.ack) as u8);
        }
        else {
            buf.put_u16_le(self.ack);
        }

        if prefix.contains(Prefix::ACK_BITS_BYTE0) {
            buf.put_u8(self.ack_bits as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE1) {
            buf.put_u8((self.ack_bits >> 8) as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE2) {
            buf.put_u8((self.ack_bits >> 16) as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE3) {
            buf.put_u8((self.ack_bits >> 24) as u8);
        }

        self.serialized_len()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < 3 {
            bail!("packet too small for a packet header: {} bytes", buf.remaining());
        }

        let prefix_byte = buf.try_get_u8()?;
        let Some(prefix) = Prefix::from_bits(prefix_byte) else {
            bail!("reserved prefix bits set: {:#04x}", prefix_byte);
        };
        if prefix.contains(Prefix::FRAGMENT) {
            bail!("prefix byte does not indicate a regular packet");
        }

        let sequence = buf.try_get_u16_le()?;

        let ack = if prefix.contains(Prefix::ACK_DELTA) {
            sequence.wrapping_sub(buf.try_get_u8()? as u16)
        }
        else {
            buf.try_get_u16_le()?
        };

        let mut ack_bits = 0xFFFF_FFFFu32;
        if prefix.contains(Prefix::ACK_BITS_BYTE0) {
            ack_bits = (ack_bits & 0xFFFF_FF00) | buf.try_get_u8()? as u32;
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE1) {
            ack_bits = (ack_bits & 0xFFFF_00FF) | ((buf.try_get_u8()? as u32) << 8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE2) {
            ack_bits = (ack_bits & 0xFF00_FFFF) | ((buf.try_get_u8()? as u32) << 16);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE3) {
            ack_bits = (ack_bits & 0x00FF_FFFF) | ((buf.try_get_u8()? as u32) << 24);
        }

        Ok(PacketHeader { sequence, ack, ack_bits })
    }
}
