//! Statistics demo: two cross-wired endpoints exchange fixed-size payloads while every
//!  fifth sequence number is dropped on the wire, printing the client's counters and
//!  smoothed statistics each iteration.

use clap::Parser;
use reliable_udp::{Endpoint, EndpointConfig, PacketHandler};

const PACKET_BYTES: usize = 290;

#[derive(Parser)]
struct Args {
    /// number of iterations to run
    #[arg(long, default_value_t = 1000)]
    iterations: usize,
}

fn generate_packet_data(sequence: u16) -> Vec<u8> {
    let mut packet_data = vec![0u8; PACKET_BYTES];
    packet_data[0] = (sequence & 0xFF) as u8;
    packet_data[1] = (sequence >> 8) as u8;
    for i in 2..PACKET_BYTES {
        packet_data[i] = ((i + sequence as usize) % 256) as u8;
    }
    packet_data
}

/// Drops every fifth sequence and validates everything that arrives.
#[derive(Default)]
struct StatsHandler {
    outbound: Vec<Vec<u8>>,
}

impl PacketHandler for StatsHandler {
    fn transmit(&mut self, _endpoint_index: usize, sequence: u16, packet: &[u8]) {
        if sequence % 5 == 0 {
            return;
        }
        self.outbound.push(packet.to_vec());
    }

    fn process(&mut self, _endpoint_index: usize, _sequence: u16, payload: &[u8]) -> bool {
        assert_eq!(payload.len(), PACKET_BYTES, "invalid payload size");
        let sequence = u16::from_le_bytes([payload[0], payload[1]]);
        assert_eq!(
            payload,
            generate_packet_data(sequence).as_slice(),
            "payload of packet {} corrupted", sequence
        );
        true
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let config = |name: &str, index| EndpointConfig {
        name: name.to_string(),
        index,
        fragment_above: PACKET_BYTES,
        ..EndpointConfig::default()
    };

    let mut time = 100.0;
    let mut client = Endpoint::new(config("client", 0), time).unwrap();
    let mut server = Endpoint::new(config("server", 1), time).unwrap();
    let mut client_handler = StatsHandler::default();
    let mut server_handler = StatsHandler::default();

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
        time += 0.01;

        let (sent_kbps, received_kbps, acked_kbps) = client.bandwidth();
        println!(
            "{} sent | {} received | {} acked | rtt = {:.1}ms | packet loss = {:.0}% | sent = {:.0}kbps | recv = {:.0}kbps | acked = {:.0}kbps",
            client.packets_sent(),
            client.packets_received(),
            client.packets_acked(),
            client.rtt(),
            client.packet_loss(),
            sent_kbps,
            received_kbps,
            acked_kbps,
        );
    }
}
