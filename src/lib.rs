//! A reliability and fragmentation layer that sits above an unreliable datagram transport,
//!  typically UDP. It provides per-packet sequence numbering, piggybacked acknowledgements
//!  of up to the last 33 packets, transparent fragmentation and reassembly of large
//!  payloads, and running link statistics (round-trip time, packet loss, and sent /
//!  received / acked bandwidth).
//!
//! ## Design goals
//!
//! * Expose reliability *signals* instead of enforcing reliability *policy*
//!   * the layer tells the caller which sequence numbers the peer has acknowledged; the
//!     caller decides per message whether in-flight data is still worth resending
//!   * there is deliberately no retransmission, no ordering and no flow control built in -
//!     latency-sensitive applications (e.g. real-time simulations) make those calls
//!     themselves, per message
//! * Keep the per-packet overhead small
//!   * the packet header is variable-length: under low loss the common header is 4 bytes
//!     (see below), the worst case 9 bytes
//! * Split big payloads without relying on IP-level fragmentation
//!   * payloads above a configured threshold are fragmented, and the reassembled packet is
//!     fed back through the regular receive path, bit-identical to an unfragmented send
//! * No I/O and no runtime inside the layer
//!   * the endpoint is a single-threaded state machine driven entirely by the caller:
//!     datagrams leave through a `transmit` hook and enter through `receive_packet`, and a
//!     periodic `update` call refreshes the statistics
//!   * transient buffers are obtained through an allocator hook, so applications can pool
//!     them
//!
//! ## Packet header
//!
//! Regular packet (all numbers little-endian):
//! ```ascii
//! 0: prefix (8 bits):
//!    * bit 0: 0 = regular packet, 1 = fragment
//!    * bit 1: ack_bits octet 0 (LSB) present, else the octet defaults to FF
//!    * bit 2: ack_bits octet 1 present
//!    * bit 3: ack_bits octet 2 present
//!    * bit 4: ack_bits octet 3 (MSB) present
//!    * bit 5: ack is a 1-byte delta below sequence, else a 2-byte absolute value
//!    * bits 6-7: reserved, must be 0
//! 1: sequence (u16)
//! 3: ack (u8 delta or u16 absolute, per bit 5)
//! *: each present ack_bits octet, LSB first
//! ```
//!
//! Bit `i` of `ack_bits` means "sequence `ack - i` was received". Octets that are all-ones
//!  are omitted, so an endpoint receiving everything pays 4 bytes per packet; the worst
//!  case is 9.
//!
//! ## Fragment header
//!
//! Payloads larger than the configured threshold are split into fragments of a fixed size
//!  (the last one may be short), each sent as its own datagram:
//! ```ascii
//! 0: prefix (u8): always 01
//! 1: sequence (u16) - the packet sequence this fragment belongs to
//! 3: fragment id (u8)
//! 4: fragment count minus one (u8)
//! 5: [fragment 0 only] the full packet header of the reassembled packet
//! *: fragment payload
//! ```
//!
//! ## What this layer does not do
//!
//! In-order delivery, retransmission, congestion control, encryption, integrity
//!  protection, NAT traversal, and connection management are all out of scope. The
//!  endpoint is stateless with regard to peer identity: one endpoint per remote peer,
//!  addressing handled by the caller's transport.

mod allocator;
mod config;
mod endpoint;
mod fragment;
mod handler;
mod packet_header;
mod sequence;
mod sequence_buffer;

pub use allocator::{BufferAllocator, HeapAllocator, PooledAllocator};
pub use config::EndpointConfig;
pub use endpoint::{Counter, Endpoint, ReceivedPacketEntry, SentPacketEntry};
pub use fragment::{FragmentHeader, ReassemblyEntry, FRAGMENT_HEADER_BYTES};
pub use handler::PacketHandler;
pub use packet_header::{PacketHeader, MAX_PACKET_HEADER_BYTES};
pub use sequence::{sequence_greater_than, sequence_less_than};
pub use sequence_buffer::SequenceBuffer;
