use anyhow::bail;

/// Configuration of an [`Endpoint`](crate::Endpoint). All values are fixed for the lifetime
///  of the endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name of this endpoint, interpolated into its log lines. Useful to tell endpoints
    ///  apart when several run in one process (the tests and demos cross-wire two).
    pub name: String,

    /// Opaque index handed to the transmit and process hooks with every invocation, so a
    ///  single handler implementation can serve several endpoints.
    pub index: usize,

    /// Largest payload accepted by `send_packet`, and largest datagram accepted by
    ///  `receive_packet`. Oversized data is counted and dropped.
    pub max_packet_size: usize,

    /// Payloads larger than this many bytes are split into fragments; everything up to and
    ///  including it goes out as a single datagram.
    ///
    /// There is no reliable way to discover the path MTU, so choosing a value that avoids
    ///  IP-level fragmentation is left to the application. With full Ethernet frames and no
    ///  optional IP headers the UDP payload is `1500 - 20 - 8 = 1472` bytes for IPv4.
    pub fragment_above: usize,

    /// Upper bound on the number of fragments per packet, at most 256.
    pub max_fragments: usize,

    /// Size of each fragment except possibly the last. `fragment_above` and `max_fragments`
    ///  must be chosen so that `max_packet_size <= max_fragments * fragment_size`.
    pub fragment_size: usize,

    /// Capacity of the list of acknowledged sequence numbers accumulated between calls to
    ///  `clear_acks`. Acks observed while the list is full are deferred to a later packet.
    pub ack_buffer_size: usize,

    /// Sliding-window capacity for bookkeeping of locally originated packets.
    pub sent_packets_buffer_size: usize,

    /// Sliding-window capacity for bookkeeping of processed inbound packets. Packets older
    ///  than this window are dropped as stale.
    pub received_packets_buffer_size: usize,

    /// Sliding-window capacity for packets currently being reassembled from fragments.
    pub fragment_reassembly_buffer_size: usize,

    pub rtt_smoothing_factor: f64,
    pub packet_loss_smoothing_factor: f64,
    pub bandwidth_smoothing_factor: f64,

    /// Estimated per-datagram network overhead in bytes, used only for bandwidth
    ///  accounting. UDP over IPv4 is 20 + 8 bytes, UDP over IPv6 is 40 + 8 bytes.
    pub packet_header_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            name: "endpoint".to_string(),
            index: 0,
            max_packet_size: 16 * 1024,
            fragment_above: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            ack_buffer_size: 256,
            sent_packets_buffer_size: 256,
            received_packets_buffer_size: 256,
            fragment_reassembly_buffer_size: 64,
            rtt_smoothing_factor: 0.0025,
            packet_loss_smoothing_factor: 0.1,
            bandwidth_smoothing_factor: 0.1,
            packet_header_size: 28,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size == 0 {
            bail!("max_packet_size must not be zero");
        }
        if self.fragment_size == 0 {
            bail!("fragment_size must not be zero");
        }
        if self.max_fragments == 0 || self.max_fragments > 256 {
            bail!("max_fragments must be in 1..=256, was {}", self.max_fragments);
        }
        if self.fragment_above > self.max_packet_size {
            bail!("fragment_above must not exceed max_packet_size");
        }
        if self.ack_buffer_size == 0
            || self.sent_packets_buffer_size == 0
            || self.received_packets_buffer_size == 0
            || self.fragment_reassembly_buffer_size == 0
        {
            bail!("buffer sizes must not be zero");
        }
        for (name, factor) in [
            ("rtt_smoothing_factor", self.rtt_smoothing_factor),
            ("packet_loss_smoothing_factor", self.packet_loss_smoothing_factor),
            ("bandwidth_smoothing_factor", self.bandwidth_smoothing_factor),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                bail!("{} must be in (0, 1], was {}", name, factor);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EndpointConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = EndpointConfig::default();
        config.max_fragments = 257;
        assert!(config.validate().is_err());

        let mut config = EndpointConfig::default();
        config.fragment_above = config.max_packet_size + 1;
        assert!(config.validate().is_err());

        let mut config = EndpointConfig::default();
        config.rtt_smoothing_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = EndpointConfig::default();
        config.sent_packets_buffer_size = 0;
        assert!(config.validate().is_err());
    }
}
