//! Robustness demo: feeds random garbage datagrams into a single endpoint. The endpoint
//!  must drop everything it cannot parse and never panic.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reliable_udp::{Counter, Endpoint, EndpointConfig, PacketHandler};

const MAX_PACKET_BYTES: usize = 16 * 1024;

#[derive(Parser)]
struct Args {
    /// number of iterations to run
    #[arg(long, default_value_t = 100_000)]
    iterations: usize,

    /// rng seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

struct NullHandler;

impl PacketHandler for NullHandler {
    fn transmit(&mut self, _endpoint_index: usize, _sequence: u16, _packet: &[u8]) {}

    fn process(&mut self, _endpoint_index: usize, _sequence: u16, _payload: &[u8]) -> bool {
        true
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut time = 100.0;
    let mut endpoint = Endpoint::new(EndpointConfig::default(), time).unwrap();
    let mut handler = NullHandler;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut packet_data = vec![0u8; MAX_PACKET_BYTES];
    for _ in 0..args.iterations {
        let packet_bytes = rng.gen_range(1..MAX_PACKET_BYTES);
        rng.fill(&mut packet_data[..packet_bytes]);

        endpoint.receive_packet(&mut handler, &packet_data[..packet_bytes]);
        endpoint.update(time);
        endpoint.clear_acks();
        time += 0.1;
    }

    println!(
        "{} iterations: {} processed, {} invalid packets, {} invalid fragments, {} stale",
        args.iterations,
        endpoint.packets_received(),
        endpoint.counter(Counter::PacketsInvalid),
        endpoint.counter(Counter::FragmentsInvalid),
        endpoint.counter(Counter::PacketsStale),
    );
}
