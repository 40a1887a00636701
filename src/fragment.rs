use anyhow::bail;
use bytes::Buf;

use crate::packet_header::{PacketHeader, MAX_PACKET_HEADER_BYTES};

/// Size of the fragment header: prefix byte, packet sequence, fragment id, fragment count.
pub const FRAGMENT_HEADER_BYTES: usize = 5;

/// The prefix byte of every fragment datagram. Regular packets always have bit 0 clear.
pub(crate) const FRAGMENT_PREFIX: u8 = 1;

/// The header prepended to each fragment of a packet whose payload exceeds the
///  fragmentation threshold. Fragment 0 additionally embeds the full packet header of the
///  reassembled packet immediately after this header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// the sequence number of the packet this fragment belongs to
    pub sequence: u16,
    pub fragment_id: usize,
    pub num_fragments: usize,
    /// the embedded packet header; present on fragment 0 only
    pub packet_header: Option<PacketHeader>,
}

impl FragmentHeader {
    /// Parses and validates a complete fragment datagram. `packet_data` is the whole
    ///  datagram including payload; payload geometry is validated against `fragment_size`.
    pub fn deser(packet_data: &[u8], max_fragments: usize, fragment_size: usize) -> anyhow::Result<FragmentHeader> {
        if packet_data.len() < FRAGMENT_HEADER_BYTES {
            bail!("packet too small for a fragment header: {} bytes", packet_data.len());
        }

        let buf = &mut &packet_data[..];

        let prefix = buf.try_get_u8()?;
        if prefix != FRAGMENT_PREFIX {
            bail!("prefix byte {:#04x} does not indicate a fragment", prefix);
        }

        let sequence = buf.try_get_u16_le()?;
        let fragment_id = buf.try_get_u8()? as usize;
        let num_fragments = buf.try_get_u8()? as usize + 1;

        if num_fragments > max_fragments {
            bail!("fragment count {} exceeds the maximum of {}", num_fragments, max_fragments);
        }
        if fragment_id >= num_fragments {
            bail!("fragment id {} outside of fragment count {}", fragment_id, num_fragments);
        }

        let mut fragment_bytes = packet_data.len() - FRAGMENT_HEADER_BYTES;

        let packet_header = if fragment_id == 0 {
            let remaining_before = buf.remaining();
            let header = PacketHeader::deser(buf)?;
            if header.sequence != sequence {
                bail!(
                    "fragment and embedded packet header disagree on sequence: {} vs {}",
                    sequence, header.sequence
                );
            }
            fragment_bytes -= remaining_before - buf.remaining();
            Some(header)
        }
        else {
            None
        };

        if fragment_bytes > fragment_size {
            bail!("fragment payload of {} bytes exceeds the fragment size {}", fragment_bytes, fragment_size);
        }
        if fragment_id != num_fragments - 1 && fragment_bytes != fragment_size {
            bail!(
                "non-final fragment {} carries {} bytes instead of the fragment size {}",
                fragment_id, fragment_bytes, fragment_size
            );
        }

        Ok(FragmentHeader {
            sequence,
            fragment_id,
            num_fragments,
            packet_header,
        })
    }
}

/// Reassembly state for one fragmented packet.
///
/// The payload buffer reserves [`MAX_PACKET_HEADER_BYTES`] bytes at its front. Fragment 0's
///  variable-length packet header is written at `MAX_PACKET_HEADER_BYTES - packet_header_bytes`,
///  and fragment `k`'s payload at `MAX_PACKET_HEADER_BYTES + k * fragment_size`, so that once
///  all fragments have arrived,
///  `packet_data[MAX_PACKET_HEADER_BYTES - packet_header_bytes .. MAX_PACKET_HEADER_BYTES + packet_bytes]`
///  is byte-identical to the original, unfragmented packet.
pub struct ReassemblyEntry {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
    pub num_fragments_received: usize,
    pub num_fragments_total: usize,
    pub packet_data: Vec<u8>,
    /// total payload size; known once the final fragment has arrived
    pub packet_bytes: usize,
    /// encoded size of the embedded packet header; known once fragment 0 has arrived
    pub packet_header_bytes: usize,
    pub fragment_received: [bool; 256],
}

impl Default for ReassemblyEntry {
    fn default() -> ReassemblyEntry {
        ReassemblyEntry {
            sequence: 0,
            ack: 0,
            ack_bits: 0,
            num_fragments_received: 0,
            num_fragments_total: 0,
            packet_data: Vec::new(),
            packet_bytes: 0,
            packet_header_bytes: 0,
            fragment_received: [false; 256],
        }
    }
}

impl ReassemblyEntry {
    /// Copies one fragment's payload into its canonical slot. `fragment_data` is the slice
    ///  following the fragment header, i.e. on fragment 0 it still starts with the embedded
    ///  packet header.
    pub fn store_fragment(
        &mut self,
        packet_header: Option<&PacketHeader>,
        fragment_id: usize,
        fragment_size: usize,
        fragment_data: &[u8],
    ) {
        let mut fragment_data = fragment_data;

        if let Some(header) = packet_header {
            self.ack = header.ack;
            self.ack_bits = header.ack_bits;

            let mut header_buf = [0u8; MAX_PACKET_HEADER_BYTES];
            let mut cursor = &mut header_buf[..];
            self.packet_header_bytes = header.ser(&mut cursor);

            self.packet_data[MAX_PACKET_HEADER_BYTES - self.packet_header_bytes..MAX_PACKET_HEADER_BYTES]
                .copy_from_slice(&header_buf[..self.packet_header_bytes]);
            fragment_data = &fragment_data[self.packet_header_bytes..];
        }

        if fragment_id == self.num_fragments_total - 1 {
            self.packet_bytes = (self.num_fragments_total - 1) * fragment_size + fragment_data.len();
        }

        let offset = MAX_PACKET_HEADER_BYTES + fragment_id * fragment_size;
        self.packet_data[offset..offset + fragment_data.len()].copy_from_slice(fragment_data);
    }
}
