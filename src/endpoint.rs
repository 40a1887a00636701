use bytes::{Buf, BufMut};
use tracing::{debug, error};

use crate::allocator::{BufferAllocator, HeapAllocator};
use crate::config::EndpointConfig;
use crate::fragment::{FragmentHeader, ReassemblyEntry, FRAGMENT_HEADER_BYTES, FRAGMENT_PREFIX};
use crate::handler::PacketHandler;
use crate::packet_header::{PacketHeader, MAX_PACKET_HEADER_BYTES};
use crate::sequence_buffer::SequenceBuffer;

/// Counted endpoint events. The error conditions among these are the endpoint's only
///  reaction to malformed or stale peer traffic: the offending datagram is dropped, the
///  counter is bumped, and processing continues.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Counter {
    PacketsSent,
    PacketsReceived,
    PacketsAcked,
    PacketsStale,
    PacketsInvalid,
    PacketsTooLargeToSend,
    PacketsTooLargeToReceive,
    FragmentsSent,
    FragmentsReceived,
    FragmentsInvalid,
}

impl Counter {
    pub const COUNT: usize = 10;
}

/// Bookkeeping for one locally originated packet, kept until the sent window slides past it.
#[derive(Debug, Default, Copy, Clone)]
pub struct SentPacketEntry {
    pub time: f64,
    /// payload size plus the configured network overhead estimate; for bandwidth accounting
    pub packet_bytes: u32,
    pub acked: bool,
}

/// Bookkeeping for one successfully processed inbound packet.
#[derive(Debug, Default, Copy, Clone)]
pub struct ReceivedPacketEntry {
    pub time: f64,
    pub packet_bytes: u32,
}

const SMOOTHING_EPSILON: f64 = 0.00001;

/// One side of a reliability channel over an unreliable datagram transport.
///
/// The endpoint numbers outbound packets, piggybacks acknowledgements of the last 33
///  received sequences on every outbound packet, splits large payloads into fragments and
///  reassembles them on the receiving side, and keeps running link statistics. It does
///  *not* retransmit: the caller watches [`acks`](Endpoint::acks) and decides per message
///  whether in-flight data is still worth resending.
///
/// The endpoint performs no I/O and owns no socket. Datagrams leave through the handler's
///  `transmit` hook and enter through [`receive_packet`](Endpoint::receive_packet); the
///  caller drives everything from a single task and calls [`update`](Endpoint::update)
///  once per tick to refresh the statistics.
pub struct Endpoint {
    config: EndpointConfig,
    time: f64,
    rtt: f64,
    packet_loss: f64,
    sent_bandwidth_kbps: f64,
    received_bandwidth_kbps: f64,
    acked_bandwidth_kbps: f64,
    acks: Vec<u16>,
    sequence: u16,
    sent_packets: SequenceBuffer<SentPacketEntry>,
    received_packets: SequenceBuffer<ReceivedPacketEntry>,
    fragment_reassembly: SequenceBuffer<ReassemblyEntry>,
    counters: [u64; Counter::COUNT],
    allocator: Box<dyn BufferAllocator>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, time: f64) -> anyhow::Result<Endpoint> {
        Endpoint::with_allocator(config, time, Box::new(HeapAllocator))
    }

    pub fn with_allocator(
        config: EndpointConfig,
        time: f64,
        allocator: Box<dyn BufferAllocator>,
    ) -> anyhow::Result<Endpoint> {
        config.validate()?;

        Ok(Endpoint {
            sent_packets: SequenceBuffer::new(config.sent_packets_buffer_size),
            received_packets: SequenceBuffer::new(config.received_packets_buffer_size),
            fragment_reassembly: SequenceBuffer::new(config.fragment_reassembly_buffer_size),
            acks: Vec::with_capacity(config.ack_buffer_size),
            config,
            time,
            rtt: 0.0,
            packet_loss: 0.0,
            sent_bandwidth_kbps: 0.0,
            received_bandwidth_kbps: 0.0,
            acked_bandwidth_kbps: 0.0,
            sequence: 0,
            counters: [0; Counter::COUNT],
            allocator,
        })
    }

    /// The sequence number the next call to `send_packet` will use.
    pub fn next_packet_sequence(&self) -> u16 {
        self.sequence
    }

    /// Frames `packet_data` and hands one or more datagrams to the handler's `transmit`
    ///  hook, fragmenting if the payload exceeds the configured threshold.
    pub fn send_packet(&mut self, handler: &mut impl PacketHandler, packet_data: &[u8]) {
        if packet_data.len() > self.config.max_packet_size {
            error!(
                "[{}] packet too large to send: {} bytes, maximum is {}",
                self.config.name, packet_data.len(), self.config.max_packet_size
            );
            self.bump(Counter::PacketsTooLargeToSend);
            return;
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let (ack, ack_bits) = self.received_packets.generate_ack_bits();
        let header = PacketHeader { sequence, ack, ack_bits };

        let entry = self.sent_packets.insert(sequence)
            .expect("the next outgoing sequence is always at the head of the sent window");
        entry.time = self.time;
        entry.packet_bytes = (self.config.packet_header_size + packet_data.len()) as u32;
        entry.acked = false;

        if packet_data.len() <= self.config.fragment_above {
            debug!("[{}] sending packet {} without fragmentation", self.config.name, sequence);

            let mut transmit_data = self.allocator.allocate(MAX_PACKET_HEADER_BYTES + packet_data.len());
            let mut cursor = &mut transmit_data[..];
            let header_bytes = header.ser(&mut cursor);
            cursor.put_slice(packet_data);

            handler.transmit(self.config.index, sequence, &transmit_data[..header_bytes + packet_data.len()]);
            self.allocator.free(transmit_data);
        }
        else {
            let num_fragments = packet_data.len().div_ceil(self.config.fragment_size);
            debug!("[{}] sending packet {} as {} fragments", self.config.name, sequence, num_fragments);

            let mut header_data = [0u8; MAX_PACKET_HEADER_BYTES];
            let header_bytes = header.ser(&mut &mut header_data[..]);

            let fragment_buffer_size = FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES + self.config.fragment_size;
            let mut fragment_data = self.allocator.allocate(fragment_buffer_size);

            for (fragment_id, chunk) in packet_data.chunks(self.config.fragment_size).enumerate() {
                let mut cursor = &mut fragment_data[..];
                cursor.put_u8(FRAGMENT_PREFIX);
                cursor.put_u16_le(sequence);
                cursor.put_u8(fragment_id as u8);
                cursor.put_u8((num_fragments - 1) as u8);

                let mut fragment_bytes = FRAGMENT_HEADER_BYTES + chunk.len();
                if fragment_id == 0 {
                    cursor.put_slice(&header_data[..header_bytes]);
                    fragment_bytes += header_bytes;
                }
                cursor.put_slice(chunk);

                handler.transmit(self.config.index, sequence, &fragment_data[..fragment_bytes]);
                self.bump(Counter::FragmentsSent);
            }
            self.allocator.free(fragment_data);
        }

        self.bump(Counter::PacketsSent);
    }

    /// Feeds one inbound datagram into the endpoint. Regular packets are handed to the
    ///  handler's `process` hook and their piggybacked acks extracted; fragments are
    ///  collected until their packet completes, at which point the reassembled packet is
    ///  fed back through this same entry point.
    pub fn receive_packet(&mut self, handler: &mut impl PacketHandler, packet_data: &[u8]) {
        if packet_data.len() > self.config.max_packet_size {
            error!(
                "[{}] packet too large to receive: {} bytes, maximum is {}",
                self.config.name, packet_data.len(), self.config.max_packet_size
            );
            self.bump(Counter::PacketsTooLargeToReceive);
            return;
        }
        if packet_data.is_empty() {
            error!("[{}] ignoring empty packet", self.config.name);
            self.bump(Counter::PacketsInvalid);
            return;
        }

        if packet_data[0] & 1 == 0 {
            self.receive_regular_packet(handler, packet_data);
        }
        else {
            self.receive_fragment(handler, packet_data);
        }
    }

    fn receive_regular_packet(&mut self, handler: &mut impl PacketHandler, packet_data: &[u8]) {
        self.bump(Counter::PacketsReceived);

        let buf = &mut &packet_data[..];
        let header = match PacketHeader::deser(buf) {
            Ok(header) => header,
            Err(e) => {
                error!("[{}] ignoring invalid packet: {}", self.config.name, e);
                self.bump(Counter::PacketsInvalid);
                return;
            }
        };
        let header_bytes = packet_data.len() - buf.remaining();

        if !self.received_packets.test_insert(header.sequence) {
            error!("[{}] ignoring stale packet {}", self.config.name, header.sequence);
            self.bump(Counter::PacketsStale);
            return;
        }

        debug!("[{}] processing packet {}", self.config.name, header.sequence);
        if !handler.process(self.config.index, header.sequence, &packet_data[header_bytes..]) {
            return;
        }

        let entry = self.received_packets.insert(header.sequence)
            .expect("a sequence that passed test_insert is insertable");
        entry.time = self.time;
        entry.packet_bytes = (self.config.packet_header_size + packet_data.len()) as u32;

        let mut ack_bits = header.ack_bits;
        for i in 0..32u16 {
            if ack_bits & 1 != 0 {
                let ack_sequence = header.ack.wrapping_sub(i);
                if let Some(sent) = self.sent_packets.find_mut(ack_sequence) {
                    if !sent.acked && self.acks.len() < self.config.ack_buffer_size {
                        debug!("[{}] acked packet {}", self.config.name, ack_sequence);
                        sent.acked = true;
                        self.acks.push(ack_sequence);
                        self.counters[Counter::PacketsAcked as usize] += 1;

                        let rtt = (self.time - sent.time) * 1000.0;
                        self.rtt = smooth(self.rtt, rtt, self.config.rtt_smoothing_factor);
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    fn receive_fragment(&mut self, handler: &mut impl PacketHandler, packet_data: &[u8]) {
        let fragment_header =
            match FragmentHeader::deser(packet_data, self.config.max_fragments, self.config.fragment_size) {
                Ok(header) => header,
                Err(e) => {
                    error!("[{}] ignoring invalid fragment: {}", self.config.name, e);
                    self.bump(Counter::FragmentsInvalid);
                    return;
                }
            };
        let sequence = fragment_header.sequence;

        if self.fragment_reassembly.find(sequence).is_none() {
            if !self.fragment_reassembly.test_insert(sequence) {
                error!(
                    "[{}] ignoring invalid fragment: reassembly window has moved past packet {}",
                    self.config.name, sequence
                );
                self.bump(Counter::FragmentsInvalid);
                return;
            }

            let packet_buffer_size =
                MAX_PACKET_HEADER_BYTES + fragment_header.num_fragments * self.config.fragment_size;
            let packet_buffer = self.allocator.allocate(packet_buffer_size);

            let entry = self.fragment_reassembly.insert(sequence)
                .expect("a sequence that passed test_insert is insertable");
            entry.sequence = sequence;
            entry.ack = 0;
            entry.ack_bits = 0;
            entry.num_fragments_received = 0;
            entry.num_fragments_total = fragment_header.num_fragments;
            entry.packet_data = packet_buffer;
            entry.packet_bytes = 0;
            entry.packet_header_bytes = 0;
            entry.fragment_received = [false; 256];
        }

        let entry = self.fragment_reassembly.find(sequence)
            .expect("the reassembly entry was just looked up or inserted");

        if fragment_header.num_fragments != entry.num_fragments_total {
            error!(
                "[{}] ignoring invalid fragment: fragment count mismatch, expected {}, got {}",
                self.config.name, entry.num_fragments_total, fragment_header.num_fragments
            );
            self.bump(Counter::FragmentsInvalid);
            return;
        }
        if entry.fragment_received[fragment_header.fragment_id] {
            debug!(
                "[{}] ignoring fragment {} of packet {}: already received",
                self.config.name, fragment_header.fragment_id, sequence
            );
            return;
        }

        let entry = self.fragment_reassembly.find_mut(sequence)
            .expect("the reassembly entry was just looked up or inserted");
        entry.num_fragments_received += 1;
        entry.fragment_received[fragment_header.fragment_id] = true;
        debug!(
            "[{}] received fragment {} of packet {} ({}/{})",
            self.config.name, fragment_header.fragment_id, sequence,
            entry.num_fragments_received, entry.num_fragments_total
        );

        entry.store_fragment(
            fragment_header.packet_header.as_ref(),
            fragment_header.fragment_id,
            self.config.fragment_size,
            &packet_data[FRAGMENT_HEADER_BYTES..],
        );

        if entry.num_fragments_received == entry.num_fragments_total {
            debug!("[{}] completed reassembly of packet {}", self.config.name, sequence);
            let packet_data = std::mem::take(&mut entry.packet_data);
            let start = MAX_PACKET_HEADER_BYTES - entry.packet_header_bytes;
            let end = MAX_PACKET_HEADER_BYTES + entry.packet_bytes;
            self.fragment_reassembly.remove(sequence);

            // the reassembled buffer is a regular packet, so this recurses at most one level
            self.receive_packet(handler, &packet_data[start..end]);
            self.allocator.free(packet_data);
        }

        self.bump(Counter::FragmentsReceived);
    }

    /// Sets the endpoint clock and refreshes the smoothed statistics. Call once per tick.
    pub fn update(&mut self, time: f64) {
        self.time = time;

        let num_samples = self.config.sent_packets_buffer_size / 2;
        if num_samples > 0 {
            let base_sequence = self.sent_packets.sequence().wrapping_sub(num_samples as u16);
            let mut num_dropped = 0;
            for i in 0..num_samples {
                let sequence = base_sequence.wrapping_add(i as u16);
                if let Some(entry) = self.sent_packets.find(sequence) {
                    if !entry.acked {
                        num_dropped += 1;
                    }
                }
            }
            let packet_loss = num_dropped as f64 / num_samples as f64 * 100.0;
            self.packet_loss = smooth(self.packet_loss, packet_loss, self.config.packet_loss_smoothing_factor);
        }

        if let Some(fresh) = window_bandwidth_kbps(&self.sent_packets, num_samples, |entry| {
            Some((entry.time, entry.packet_bytes))
        }) {
            self.sent_bandwidth_kbps = smooth(self.sent_bandwidth_kbps, fresh, self.config.bandwidth_smoothing_factor);
        }

        let received_samples = self.config.received_packets_buffer_size / 2;
        if let Some(fresh) = window_bandwidth_kbps(&self.received_packets, received_samples, |entry| {
            Some((entry.time, entry.packet_bytes))
        }) {
            self.received_bandwidth_kbps =
                smooth(self.received_bandwidth_kbps, fresh, self.config.bandwidth_smoothing_factor);
        }

        if let Some(fresh) = window_bandwidth_kbps(&self.sent_packets, num_samples, |entry| {
            entry.acked.then_some((entry.time, entry.packet_bytes))
        }) {
            self.acked_bandwidth_kbps =
                smooth(self.acked_bandwidth_kbps, fresh, self.config.bandwidth_smoothing_factor);
        }
    }

    /// The outbound sequence numbers acknowledged by the peer since the last `clear_acks`,
    ///  in the order they were first observed.
    pub fn acks(&self) -> &[u16] {
        &self.acks
    }

    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    /// Drops all window state and pending reassemblies and starts numbering from zero again.
    pub fn reset(&mut self) {
        self.clear_acks();
        self.sequence = 0;

        for index in 0..self.config.fragment_reassembly_buffer_size {
            if let Some(entry) = self.fragment_reassembly.at_index_mut(index) {
                let packet_data = std::mem::take(&mut entry.packet_data);
                if !packet_data.is_empty() {
                    self.allocator.free(packet_data);
                }
            }
        }

        self.sent_packets.reset();
        self.received_packets.reset();
        self.fragment_reassembly.reset();
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    /// Smoothed packet loss in percent.
    pub fn packet_loss(&self) -> f64 {
        self.packet_loss
    }

    /// Smoothed `(sent, received, acked)` bandwidth in kbps.
    pub fn bandwidth(&self) -> (f64, f64, f64) {
        (self.sent_bandwidth_kbps, self.received_bandwidth_kbps, self.acked_bandwidth_kbps)
    }

    pub fn packets_sent(&self) -> u64 {
        self.counters[Counter::PacketsSent as usize]
    }

    pub fn packets_received(&self) -> u64 {
        self.counters[Counter::PacketsReceived as usize]
    }

    pub fn packets_acked(&self) -> u64 {
        self.counters[Counter::PacketsAcked as usize]
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter as usize]
    }

    fn bump(&mut self, counter: Counter) {
        self.counters[counter as usize] += 1;
    }
}

/// Advances `current` towards `fresh` by the smoothing factor, snapping once they are
///  within epsilon of each other.
fn smooth(current: f64, fresh: f64, factor: f64) -> f64 {
    if (current - fresh).abs() > SMOOTHING_EPSILON {
        current + (fresh - current) * factor
    }
    else {
        fresh
    }
}

/// Bandwidth over the `num_samples` window entries ending just below the buffer's head:
///  total sampled bytes over the time span of their timestamps, in kbps. `None` if the
///  window holds fewer than two distinct timestamps.
fn window_bandwidth_kbps<T>(
    buffer: &SequenceBuffer<T>,
    num_samples: usize,
    sample: impl Fn(&T) -> Option<(f64, u32)>,
) -> Option<f64> {
    let base_sequence = buffer.sequence().wrapping_sub(num_samples as u16);
    let mut total_bytes = 0u64;
    let mut start_time = f64::MAX;
    let mut finish_time = 0.0f64;

    for i in 0..num_samples {
        let sequence = base_sequence.wrapping_add(i as u16);
        let Some(entry) = buffer.find(sequence) else { continue };
        let Some((time, packet_bytes)) = sample(entry) else { continue };

        total_bytes += packet_bytes as u64;
        start_time = start_time.min(time);
        finish_time = finish_time.max(time);
    }

    (finish_time > start_time).then(|| total_bytes as f64 / (finish_time - start_time) * 8.0 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockPacketHandler;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Collects transmitted datagrams so the test loop can drain them into the peer
    ///  endpoint, and records processed payload sizes.
    #[derive(Default)]
    struct QueueHandler {
        drop: bool,
        outbound: Vec<Vec<u8>>,
        num_processed: usize,
    }

    impl PacketHandler for QueueHandler {
        fn transmit(&mut self, _endpoint_index: usize, _sequence: u16, packet: &[u8]) {
            if !self.drop {
                self.outbound.push(packet.to_vec());
            }
        }

        fn process(&mut self, _endpoint_index: usize, _sequence: u16, _payload: &[u8]) -> bool {
            self.num_processed += 1;
            true
        }
    }

    fn test_endpoint(name: &str, index: usize) -> Endpoint {
        let config = EndpointConfig {
            name: name.to_string(),
            index,
            ..EndpointConfig::default()
        };
        Endpoint::new(config, 100.0).unwrap()
    }

    fn deliver(from: &mut QueueHandler, to: &mut Endpoint, to_handler: &mut QueueHandler) {
        for packet in std::mem::take(&mut from.outbound) {
            to.receive_packet(to_handler, &packet);
        }
    }

    const ACK_ITERATIONS: usize = 256;

    #[test]
    fn test_acks_converge_without_loss() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = QueueHandler::default();
        let mut receiver_handler = QueueHandler::default();

        let mut time = 100.0;
        for _ in 0..ACK_ITERATIONS {
            let dummy_packet = [1u8, 2, 3, 4, 5, 6, 7, 8];

            sender.send_packet(&mut sender_handler, &dummy_packet);
            deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);

            receiver.send_packet(&mut receiver_handler, &dummy_packet);
            deliver(&mut receiver_handler, &mut sender, &mut sender_handler);

            sender.update(time);
            receiver.update(time);
            time += 0.01;
        }

        for endpoint in [&sender, &receiver] {
            let mut acked = [false; ACK_ITERATIONS];
            for &ack in endpoint.acks() {
                if (ack as usize) < ACK_ITERATIONS {
                    acked[ack as usize] = true;
                }
            }
            for (sequence, was_acked) in acked.iter().enumerate().take(ACK_ITERATIONS / 2) {
                assert!(*was_acked, "sequence {} was never acked", sequence);
            }
        }
    }

    #[test]
    fn test_acks_with_alternating_loss() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = QueueHandler::default();
        let mut receiver_handler = QueueHandler::default();

        let mut time = 100.0;
        for i in 0..ACK_ITERATIONS {
            let dummy_packet = [1u8, 2, 3, 4, 5, 6, 7, 8];

            sender_handler.drop = i % 2 == 1;
            receiver_handler.drop = i % 2 == 1;

            sender.send_packet(&mut sender_handler, &dummy_packet);
            deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);

            receiver.send_packet(&mut receiver_handler, &dummy_packet);
            deliver(&mut receiver_handler, &mut sender, &mut sender_handler);

            sender.update(time);
            receiver.update(time);
            time += 0.1;
        }

        for endpoint in [&sender, &receiver] {
            let mut acked = [false; ACK_ITERATIONS];
            for &ack in endpoint.acks() {
                if (ack as usize) < ACK_ITERATIONS {
                    acked[ack as usize] = true;
                }
            }
            for (sequence, was_acked) in acked.iter().enumerate().take(ACK_ITERATIONS / 2) {
                assert_eq!(
                    *was_acked,
                    sequence % 2 == 0,
                    "wrong ack state for sequence {}", sequence
                );
            }
        }
    }

    const SOAK_MAX_PACKET_BYTES: usize = 4 * 1024;

    fn generate_packet_data(sequence: u16) -> Vec<u8> {
        let packet_bytes = (sequence as usize * 1023) % (SOAK_MAX_PACKET_BYTES - 2) + 2;
        let mut packet_data = vec![0u8; packet_bytes];
        packet_data[0] = (sequence & 0xFF) as u8;
        packet_data[1] = (sequence >> 8) as u8;
        for i in 2..packet_bytes {
            packet_data[i] = ((i + sequence as usize) % 256) as u8;
        }
        packet_data
    }

    /// Drops ~5% of datagrams and validates every processed payload against the generator.
    struct SoakHandler {
        rng: StdRng,
        outbound: Vec<Vec<u8>>,
        num_processed: usize,
    }

    impl SoakHandler {
        fn new(seed: u64) -> SoakHandler {
            SoakHandler {
                rng: StdRng::seed_from_u64(seed),
                outbound: Vec::new(),
                num_processed: 0,
            }
        }
    }

    impl PacketHandler for SoakHandler {
        fn transmit(&mut self, _endpoint_index: usize, _sequence: u16, packet: &[u8]) {
            if self.rng.gen_range(0..100) < 5 {
                return;
            }
            self.outbound.push(packet.to_vec());
        }

        fn process(&mut self, _endpoint_index: usize, _sequence: u16, payload: &[u8]) -> bool {
            assert!(payload.len() >= 2 && payload.len() <= SOAK_MAX_PACKET_BYTES);
            let sequence = u16::from_le_bytes([payload[0], payload[1]]);
            assert_eq!(
                payload,
                generate_packet_data(sequence).as_slice(),
                "payload of packet {} corrupted", sequence
            );
            self.num_processed += 1;
            true
        }
    }

    #[test]
    fn test_fragmentation_round_trip_under_loss() {
        let config = |name: &str, index| EndpointConfig {
            name: name.to_string(),
            index,
            fragment_above: 500,
            ..EndpointConfig::default()
        };
        let mut client = Endpoint::new(config("client", 0), 100.0).unwrap();
        let mut server = Endpoint::new(config("server", 1), 100.0).unwrap();
        let mut client_handler = SoakHandler::new(1);
        let mut server_handler = SoakHandler::new(2);

        let mut time = 100.0;
        for _ in 0..2000 {
            let packet_data = generate_packet_data(client.next_packet_sequence());
            client.send_packet(&mut client_handler, &packet_data);
            for packet in std::mem::take(&mut client_handler.outbound) {
                server.receive_packet(&mut server_handler, &packet);
            }

            let packet_data = generate_packet_data(server.next_packet_sequence());
            server.send_packet(&mut server_handler, &packet_data);
            for packet in std::mem::take(&mut server_handler.outbound) {
                client.receive_packet(&mut client_handler, &packet);
            }

            client.update(time);
            server.update(time);
            client.clear_acks();
            server.clear_acks();
            time += 0.1;
        }

        // every payload that got through was validated byte for byte in process();
        // with 5% loss the vast majority must get through
        assert!(server_handler.num_processed > 1500, "only {} packets processed", server_handler.num_processed);
        assert!(client_handler.num_processed > 1500, "only {} packets processed", client_handler.num_processed);
        assert!(server.counter(Counter::FragmentsReceived) > 0);
        assert_eq!(server.counter(Counter::FragmentsInvalid), 0);
    }

    #[test]
    fn test_stats_without_loss() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = QueueHandler::default();
        let mut receiver_handler = QueueHandler::default();

        let mut time = 100.0;
        for _ in 0..1000 {
            let dummy_packet = [0u8; 32];

            sender.send_packet(&mut sender_handler, &dummy_packet);
            deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);

            receiver.send_packet(&mut receiver_handler, &dummy_packet);
            deliver(&mut receiver_handler, &mut sender, &mut sender_handler);

            sender.update(time);
            receiver.update(time);
            sender.clear_acks();
            receiver.clear_acks();
            time += 0.01;
        }

        assert!(sender.packet_loss() < 1.0, "packet loss was {}", sender.packet_loss());
        assert!(sender.rtt() < 1.0, "rtt was {}", sender.rtt());

        let (sent_kbps, received_kbps, acked_kbps) = sender.bandwidth();
        assert!(sent_kbps > 0.0);
        assert!(received_kbps > 0.0);
        assert!(acked_kbps > 0.0);

        assert_eq!(sender_handler.num_processed, 1000);
        assert_eq!(receiver_handler.num_processed, 1000);
    }

    #[test]
    fn test_stats_with_alternating_loss() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = QueueHandler::default();
        let mut receiver_handler = QueueHandler::default();

        let mut time = 100.0;
        for i in 0..1000 {
            let dummy_packet = [0u8; 32];

            sender_handler.drop = i % 2 == 1;
            receiver_handler.drop = i % 2 == 1;

            sender.send_packet(&mut sender_handler, &dummy_packet);
            deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);

            receiver.send_packet(&mut receiver_handler, &dummy_packet);
            deliver(&mut receiver_handler, &mut sender, &mut sender_handler);

            sender.update(time);
            receiver.update(time);
            sender.clear_acks();
            receiver.clear_acks();
            time += 0.1;
        }

        assert!(sender.packet_loss() > 40.0, "packet loss was {}", sender.packet_loss());
    }

    /// Captures transmitted datagrams verbatim so tests can inspect or replay them.
    #[derive(Default)]
    struct CaptureHandler {
        datagrams: Vec<Vec<u8>>,
        num_processed: usize,
    }

    impl PacketHandler for CaptureHandler {
        fn transmit(&mut self, _endpoint_index: usize, _sequence: u16, packet: &[u8]) {
            self.datagrams.push(packet.to_vec());
        }

        fn process(&mut self, _endpoint_index: usize, _sequence: u16, _payload: &[u8]) -> bool {
            self.num_processed += 1;
            true
        }
    }

    #[test]
    fn test_duplicate_fragments_are_ignored() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = CaptureHandler::default();
        let mut receiver_handler = CaptureHandler::default();

        sender.send_packet(&mut sender_handler, &[0xCD; 3000]);
        assert_eq!(sender_handler.datagrams.len(), 3);

        // duplicates before completion must not advance the reassembly
        let fragments = sender_handler.datagrams.clone();
        receiver.receive_packet(&mut receiver_handler, &fragments[0]);
        receiver.receive_packet(&mut receiver_handler, &fragments[0]);
        receiver.receive_packet(&mut receiver_handler, &fragments[1]);
        receiver.receive_packet(&mut receiver_handler, &fragments[1]);
        assert_eq!(receiver_handler.num_processed, 0);

        receiver.receive_packet(&mut receiver_handler, &fragments[2]);
        assert_eq!(receiver_handler.num_processed, 1);

        // duplicates are not counted as invalid
        assert_eq!(receiver.counter(Counter::FragmentsInvalid), 0);
        assert_eq!(receiver.counter(Counter::FragmentsReceived), 3);
    }

    fn regular_packet(sequence: u16) -> Vec<u8> {
        let header = PacketHeader { sequence, ack: 0xFFFF, ack_bits: 0 };
        let mut packet = Vec::new();
        header.ser(&mut packet);
        packet.extend_from_slice(&[1, 2, 3, 4]);
        packet
    }

    #[test]
    fn test_process_returning_false_discards_the_packet() {
        let mut endpoint = test_endpoint("endpoint", 0);
        let packet = regular_packet(0);

        let mut handler = MockPacketHandler::new();
        handler.expect_process().times(1).returning(|_, _, _| false);
        endpoint.receive_packet(&mut handler, &packet);
        assert_eq!(endpoint.counter(Counter::PacketsReceived), 1);

        // the discarded packet left no received entry, so the next outgoing packet
        // acknowledges nothing
        let mut capture = CaptureHandler::default();
        endpoint.send_packet(&mut capture, &[0u8; 4]);
        let outgoing = PacketHeader::deser(&mut capture.datagrams[0].as_slice()).unwrap();
        assert_eq!(outgoing.ack, 0xFFFF);
        assert_eq!(outgoing.ack_bits, 0);

        // accepting the same packet records it, and later sends acknowledge it
        let mut handler = MockPacketHandler::new();
        handler.expect_process().times(1).returning(|_, _, _| true);
        endpoint.receive_packet(&mut handler, &packet);

        let mut capture = CaptureHandler::default();
        endpoint.send_packet(&mut capture, &[0u8; 4]);
        let outgoing = PacketHeader::deser(&mut capture.datagrams[0].as_slice()).unwrap();
        assert_eq!(outgoing.ack, 0);
        assert_eq!(outgoing.ack_bits & 1, 1);
    }

    #[test]
    fn test_packets_behind_the_receive_window_are_stale() {
        let mut endpoint = test_endpoint("endpoint", 0);
        let mut handler = QueueHandler::default();

        endpoint.receive_packet(&mut handler, &regular_packet(1000));
        endpoint.receive_packet(&mut handler, &regular_packet(0));

        assert_eq!(endpoint.counter(Counter::PacketsReceived), 2);
        assert_eq!(endpoint.counter(Counter::PacketsStale), 1);
        assert_eq!(handler.num_processed, 1);
    }

    #[test]
    fn test_oversized_packets_are_counted_and_dropped() {
        let mut endpoint = test_endpoint("endpoint", 0);
        let oversized = vec![0u8; endpoint.config.max_packet_size + 1];

        let mut handler = MockPacketHandler::new();
        endpoint.send_packet(&mut handler, &oversized);
        assert_eq!(endpoint.counter(Counter::PacketsTooLargeToSend), 1);
        assert_eq!(endpoint.packets_sent(), 0);
        assert_eq!(endpoint.next_packet_sequence(), 0);

        endpoint.receive_packet(&mut handler, &oversized);
        assert_eq!(endpoint.counter(Counter::PacketsTooLargeToReceive), 1);
    }

    #[test]
    fn test_garbage_input_does_not_panic() {
        let mut endpoint = test_endpoint("endpoint", 0);
        let mut handler = QueueHandler::default();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            let size = rng.gen_range(1..=SOAK_MAX_PACKET_BYTES);
            let mut packet = vec![0u8; size];
            rng.fill(packet.as_mut_slice());
            endpoint.receive_packet(&mut handler, &packet);
        }
        endpoint.receive_packet(&mut handler, &[]);
        endpoint.update(101.0);
    }

    #[test]
    fn test_reset() {
        let mut sender = test_endpoint("sender", 0);
        let mut receiver = test_endpoint("receiver", 1);
        let mut sender_handler = QueueHandler::default();
        let mut receiver_handler = QueueHandler::default();

        for _ in 0..4 {
            sender.send_packet(&mut sender_handler, &[0u8; 8]);
            deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);
            receiver.send_packet(&mut receiver_handler, &[0u8; 8]);
            deliver(&mut receiver_handler, &mut sender, &mut sender_handler);
        }
        assert!(!sender.acks().is_empty());
        assert_eq!(sender.next_packet_sequence(), 4);

        // leave a partial reassembly behind, then reset
        sender.send_packet(&mut sender_handler, &[0xCD; 3000]);
        let fragments = std::mem::take(&mut sender_handler.outbound);
        receiver.receive_packet(&mut receiver_handler, &fragments[0]);

        sender.reset();
        receiver.reset();

        assert!(sender.acks().is_empty());
        assert_eq!(sender.next_packet_sequence(), 0);

        // a fresh exchange works and sequences start over
        sender.send_packet(&mut sender_handler, &[0u8; 8]);
        deliver(&mut sender_handler, &mut receiver, &mut receiver_handler);
        receiver.send_packet(&mut receiver_handler, &[0u8; 8]);
        deliver(&mut receiver_handler, &mut sender, &mut sender_handler);
        assert_eq!(sender.acks(), &[0]);
    }

    #[test]
    fn test_next_packet_sequence_tracks_sends() {
        let mut endpoint = test_endpoint("endpoint", 0);
        let mut handler = QueueHandler::default();

        assert_eq!(endpoint.next_packet_sequence(), 0);
        endpoint.send_packet(&mut handler, &[0u8; 8]);
        assert_eq!(endpoint.next_packet_sequence(), 1);
        endpoint.send_packet(&mut handler, &[0u8; 8]);
        assert_eq!(endpoint.next_packet_sequence(), 2);
    }
}
