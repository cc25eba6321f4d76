//! See [`ConnectionManager`].

use crate::ChannelMessage;

/// Callback surface the protocol engine drives.
///
/// The application provides one implementation per endpoint. The engine
/// calls into it to hand finished datagrams to the socket substrate, to
/// deliver reassembled packet payloads, and to read the clock and the
/// liveness of connection slots.
///
/// Connection slots are small integers naming one peer relationship; all
/// per-peer state in the engine is indexed by slot.
pub trait ConnectionManager {
    /// Forwards one finished datagram to the datagram substrate.
    ///
    /// The engine reuses the buffer after this call returns, so the
    /// implementation must copy (or finish sending) the bytes before then.
    fn send_raw_packet(&mut self, conn: usize, data: &[u8]);

    /// Called when a fully reassembled packet payload is ready.
    ///
    /// Returning `false` rejects the packet: it is not recorded as received
    /// and its acks are not processed.
    fn process_payload(&mut self, conn: usize, sequence: u16, payload: &[u8]) -> bool;

    /// Current time in milliseconds. Only differences matter; any monotonic
    /// origin will do.
    fn now_millis(&self) -> u64;

    /// Whether the given connection slot currently names a live peer.
    fn is_connection_alive(&self, conn: usize) -> bool;

    /// Handles a message arriving on an unreliable-process channel.
    ///
    /// Called synchronously from packet processing; the envelope is dropped
    /// when this returns, so any data to be kept must be copied out.
    fn handle_unreliable(&mut self, conn: usize, message: ChannelMessage) {
        let _ = (conn, message);
    }
}
