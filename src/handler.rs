#[cfg(test)] use mockall::automock;

/// The two hooks through which an [`Endpoint`](crate::Endpoint) talks to the outside world.
///  Both are invoked synchronously from within the endpoint operation that triggered them,
///  and a handler must not re-enter the endpoint it is serving (driving *other* endpoints
///  is fine).
#[cfg_attr(test, automock)]
pub trait PacketHandler {
    /// Called with every datagram the endpoint wants on the wire: the framed packet itself,
    ///  or one datagram per fragment. `sequence` is the packet sequence in both cases.
    ///  Ownership of `packet` ends when this returns; the buffer must not be retained.
    fn transmit(&mut self, endpoint_index: usize, sequence: u16, packet: &[u8]);

    /// Called with every fully (re)assembled inbound payload, in arrival order, which is
    ///  not necessarily sequence order. Returning `false` discards the packet: no received
    ///  entry is recorded and no piggybacked acks are extracted from it.
    fn process(&mut self, endpoint_index: usize, sequence: u16, payload: &[u8]) -> bool;
}
