//! Long-running exerciser: two cross-wired endpoints exchange variable-size payloads
//!  (most of them fragmented) under 5% simulated packet loss, validating every payload
//!  byte for byte on arrival.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reliable_udp::{BufferAllocator, Endpoint, EndpointConfig, HeapAllocator, PacketHandler, PooledAllocator};

const MAX_PACKET_BYTES: usize = 16 * 1024;

#[derive(Parser)]
struct Args {
    /// number of iterations to run
    #[arg(long, default_value_t = 8000)]
    iterations: usize,

    /// use the pooled allocator instead of plain heap allocation
    #[arg(long)]
    pooled: bool,

    /// log per-packet endpoint activity
    #[arg(long)]
    verbose: bool,
}

fn generate_packet_data(sequence: u16) -> Vec<u8> {
    let packet_bytes = (sequence as usize * 1023) % (MAX_PACKET_BYTES - 2) + 2;
    let mut packet_data = vec![0u8; packet_bytes];
    packet_data[0] = (sequence & 0xFF) as u8;
    packet_data[1] = (sequence >> 8) as u8;
    for i in 2..packet_bytes {
        packet_data[i] = ((i + sequence as usize) % 256) as u8;
    }
    packet_data
}

struct SoakHandler {
    rng: StdRng,
    outbound: Vec<Vec<u8>>,
    num_processed: u64,
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
        assert!(payload.len() >= 2 && payload.len() <= MAX_PACKET_BYTES, "invalid payload size");
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

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN })
        .init();

    let allocator = || -> Box<dyn BufferAllocator> {
        if args.pooled {
            Box::new(PooledAllocator::new(64))
        }
        else {
            Box::new(HeapAllocator)
        }
    };
    let config = |name: &str, index| EndpointConfig {
        name: name.to_string(),
        index,
        fragment_above: 500,
        ..EndpointConfig::default()
    };

    let mut time = 100.0;
    let mut client = Endpoint::with_allocator(config("client", 0), time, allocator()).unwrap();
    let mut server = Endpoint::with_allocator(config("server", 1), time, allocator()).unwrap();
    let mut client_handler = SoakHandler::new(1);
    let mut server_handler = SoakHandler::new(2);

    for _ in 0..args.iterations {
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

    println!(
        "{} iterations: client processed {}, server processed {}",
        args.iterations, client_handler.num_processed, server_handler.num_processed
    );
}
