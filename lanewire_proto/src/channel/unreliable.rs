//! See [`UnreliableUnorderedChannel`].

use crossbeam::queue::ArrayQueue;
use lanewire::{ChannelCounter, ChannelKind, ChannelMessage, ErrorLevel};
use tracing::{trace, warn};

use crate::stream::{ReadStream, WriteStream};

use super::{ChannelConfig, PacketHandler};

/// Channel delivering messages at most once, in whatever order packets
/// happen to arrive.
///
/// Messages are serialised straight out of a bounded send ring into the
/// next packet with room for them; messages that do not fit are dropped
/// rather than delayed. Arrivals go into a bounded receive ring drained by
/// [`UnreliableUnorderedChannel::receive_message`]; if the application
/// falls behind, overflow is dropped.
///
/// Block messages are not supported here - there is no retransmission to
/// carry the fragments of one.
#[derive(Debug)]
pub struct UnreliableUnorderedChannel {
    config: ChannelConfig,
    error_level: Box<[ErrorLevel]>,
    send_queue: Box<[ArrayQueue<ChannelMessage>]>,
    receive_queue: Box<[ArrayQueue<ChannelMessage>]>,
    counters: Box<[u64]>,
}

impl UnreliableUnorderedChannel {
    /// Delivery contract of this channel type.
    pub const KIND: ChannelKind = ChannelKind::UnreliableUnordered;

    /// Creates the channel with both rings preallocated.
    ///
    /// # Panics
    ///
    /// Panics if the config is inconsistent.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        config.validate();
        let conns = config.max_connections;
        Self {
            error_level: vec![ErrorLevel::None; conns].into_boxed_slice(),
            send_queue: (0..conns)
                .map(|_| ArrayQueue::new(config.send_queue_size))
                .collect(),
            receive_queue: (0..conns)
                .map(|_| ArrayQueue::new(config.receive_queue_size))
                .collect(),
            counters: vec![0; conns * ChannelCounter::COUNT].into_boxed_slice(),
            config,
        }
    }

    /// The configuration this channel was built with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current error level.
    #[must_use]
    pub fn error_level(&self, conn: usize) -> ErrorLevel {
        self.error_level[conn]
    }

    /// Value of one counter.
    #[must_use]
    pub fn counter(&self, conn: usize, counter: ChannelCounter) -> u64 {
        self.counters[conn * ChannelCounter::COUNT + counter.index()]
    }

    /// Resets every connection slot, releasing all queued messages.
    pub fn reset_all(&mut self) {
        for conn in 0..self.config.max_connections {
            self.reset(conn);
        }
    }

    /// Resets one connection slot.
    pub fn reset(&mut self, conn: usize) {
        self.error_level[conn] = ErrorLevel::None;
        while self.send_queue[conn].pop().is_some() {}
        while self.receive_queue[conn].pop().is_some() {}
        let range = conn * ChannelCounter::COUNT..(conn + 1) * ChannelCounter::COUNT;
        self.counters[range].fill(0);
    }

    /// Queues `message` for best-effort delivery.
    ///
    /// On a full ring the channel transitions to
    /// [`ErrorLevel::SendQueueFull`] and the message is dropped.
    pub fn send_message(&mut self, conn: usize, message: ChannelMessage) {
        debug_assert!(!message.is_block);
        if self.error_level[conn] != ErrorLevel::None {
            return;
        }

        if self.send_queue[conn].push(message).is_err() {
            self.set_error_level(conn, ErrorLevel::SendQueueFull);
            return;
        }

        self.counters[conn * ChannelCounter::COUNT + ChannelCounter::MessagesSent.index()] += 1;
    }

    /// Returns a received message, if any is queued. Ownership of the
    /// payload transfers to the caller.
    pub fn receive_message(&mut self, conn: usize) -> Option<ChannelMessage> {
        if self.error_level[conn] != ErrorLevel::None {
            return None;
        }
        let message = self.receive_queue[conn].pop()?;
        self.counters[conn * ChannelCounter::COUNT + ChannelCounter::MessagesReceived.index()] += 1;
        Some(message)
    }

    /// Serialises as many queued messages as fit in `available_bits`.
    ///
    /// Queued messages that do not fit this packet are dropped - this
    /// channel never delays.
    ///
    /// Returns the number of bits written; 0 means no channel data.
    pub fn get_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut WriteStream,
        available_bits: u32,
    ) -> u32 {
        if self.error_level[conn] != ErrorLevel::None {
            return 0;
        }
        if self.send_queue[conn].is_empty() {
            return 0;
        }

        let protocol_bits = self.config.protocol_bits();
        let give_up_bits = protocol_bits + 4 * 8;
        let header_bits =
            self.config.channel_index_bits() + 1 + 1 + self.config.num_messages_bits();
        if available_bits < header_bits {
            return 0;
        }
        let mut budget = available_bits - header_bits;
        if let Some(packet_budget) = self.config.packet_budget {
            budget = budget.min(packet_budget as u32 * 8);
        }

        let mut used_bits = 0u32;
        let mut messages = Vec::new();

        loop {
            if budget.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            if messages.len() == self.config.max_messages_per_packet {
                break;
            }
            let Some(message) = self.send_queue[conn].pop() else {
                break;
            };

            let message_bits = protocol_bits + handler.message_bits(message.protocol);
            if used_bits + message_bits > budget {
                trace!(conn, protocol = message.protocol, "dropping unsent message");
                continue;
            }

            used_bits += message_bits;
            messages.push(message);
        }

        if messages.is_empty() {
            return 0;
        }

        let bits_before = stream.bits_processed();
        stream.write_int(
            self.config.channel_index as u64,
            0,
            self.config.num_channels as u64 - 1,
        );
        stream.write_bits(0, 1);
        stream.write_bits(1, 1);
        stream.write_int(
            messages.len() as u64,
            0,
            self.config.max_messages_per_packet as u64,
        );
        for message in &messages {
            stream.write_int(
                u64::from(message.protocol),
                0,
                u64::from(self.config.max_message_protocol),
            );
            handler.serialise_message(message, stream);
        }

        stream.bits_processed() - bits_before
    }

    /// Deserialises message data written by a peer's
    /// [`UnreliableUnorderedChannel::get_packet_data`], queueing arrivals.
    ///
    /// The channel-data prefix must already have been consumed.
    /// `packet_sequence` is stamped as each arrival's id.
    pub fn process_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut ReadStream,
        packet_sequence: u16,
    ) {
        if self.error_level[conn] != ErrorLevel::None {
            return;
        }

        let result = (|| {
            let num_messages =
                stream.read_int(0, self.config.max_messages_per_packet as u64)? as usize;
            for _ in 0..num_messages {
                let protocol =
                    stream.read_int(0, u64::from(self.config.max_message_protocol))? as u16;
                let mut message = ChannelMessage {
                    protocol,
                    id: packet_sequence,
                    ..ChannelMessage::default()
                };
                handler.deserialise_message(&mut message, stream)?;
                if self.receive_queue[conn].push(message).is_err() {
                    trace!(conn, "receive ring full, dropping message");
                }
            }
            Ok::<(), crate::stream::StreamError>(())
        })();

        if result.is_err() {
            self.set_error_level(conn, ErrorLevel::FailedToSerialise);
        }
    }

    fn set_error_level(&mut self, conn: usize, level: ErrorLevel) {
        if level != self.error_level[conn] && level != ErrorLevel::None {
            warn!(
                conn,
                channel = self.config.channel_index,
                %level,
                "channel went into error state"
            );
        }
        self.error_level[conn] = level;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::channel::testing::{message, TestHandler};
    use crate::channel::{read_channel_header, ChannelData};

    use super::*;

    const AVAILABLE_BITS: u32 = 16 * 1024 * 8;

    fn config() -> ChannelConfig {
        ChannelConfig {
            max_connections: 1,
            ..ChannelConfig::default()
        }
    }

    fn transfer(
        sender: &mut UnreliableUnorderedChannel,
        receiver: &mut UnreliableUnorderedChannel,
        packet_sequence: u16,
    ) -> bool {
        let mut stream = WriteStream::new(17 * 1024);
        let bits = sender.get_packet_data(&TestHandler, 0, &mut stream, AVAILABLE_BITS);
        if bits == 0 {
            return false;
        }
        stream.flush();
        let data = stream.as_bytes().to_vec();

        let mut stream = ReadStream::new(&data);
        let (index, kind) = read_channel_header(&mut stream, 2).unwrap();
        assert_eq!(index, 0);
        assert_eq!(kind, ChannelData::Messages);
        receiver.process_packet_data(&TestHandler, 0, &mut stream, packet_sequence);
        true
    }

    #[test]
    fn roundtrip() {
        let mut sender = UnreliableUnorderedChannel::new(config());
        let mut receiver = UnreliableUnorderedChannel::new(config());

        for i in 0..5u16 {
            sender.send_message(0, message(i, &[i as u8; 8]));
        }
        assert!(transfer(&mut sender, &mut receiver, 77));

        let mut received = Vec::new();
        while let Some(msg) = receiver.receive_message(0) {
            received.push(msg);
        }
        assert_eq!(received.len(), 5);
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.protocol, i as u16);
            // unreliable ids carry the packet sequence
            assert_eq!(msg.id, 77);
            assert_eq!(msg.payload.as_ref(), [i as u8; 8]);
        }
        assert_eq!(receiver.counter(0, ChannelCounter::MessagesReceived), 5);

        // the queue drained: nothing further to serialise
        assert!(!transfer(&mut sender, &mut receiver, 78));
    }

    #[test]
    fn receive_ring_overflow_drops() {
        let small = ChannelConfig {
            max_connections: 1,
            receive_queue_size: 4,
            ..ChannelConfig::default()
        };
        let mut sender = UnreliableUnorderedChannel::new(config());
        let mut receiver = UnreliableUnorderedChannel::new(small);

        for i in 0..8u16 {
            sender.send_message(0, message(i, b"x"));
        }
        assert!(transfer(&mut sender, &mut receiver, 0));

        let mut count = 0;
        while receiver.receive_message(0).is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(receiver.error_level(0), ErrorLevel::None);
    }

    #[test]
    fn send_ring_overflow_is_terminal() {
        let small = ChannelConfig {
            max_connections: 1,
            send_queue_size: 4,
            ..ChannelConfig::default()
        };
        let mut channel = UnreliableUnorderedChannel::new(small);
        for i in 0..4u16 {
            channel.send_message(0, message(i, b"y"));
        }
        assert_eq!(channel.error_level(0), ErrorLevel::None);
        channel.send_message(0, message(9, b"overflow"));
        assert_eq!(channel.error_level(0), ErrorLevel::SendQueueFull);

        channel.reset(0);
        assert_eq!(channel.error_level(0), ErrorLevel::None);
        assert_matches!(channel.receive_message(0), None);
    }

    #[test]
    fn truncated_data_fails_to_serialise() {
        let mut sender = UnreliableUnorderedChannel::new(config());
        let mut receiver = UnreliableUnorderedChannel::new(config());
        sender.send_message(0, message(1, b"some payload here"));

        let mut stream = WriteStream::new(1024);
        let bits = sender.get_packet_data(&TestHandler, 0, &mut stream, AVAILABLE_BITS);
        assert!(bits > 0);
        stream.flush();
        let data = stream.as_bytes();

        let mut stream = ReadStream::new(&data[..data.len() / 2]);
        let _ = read_channel_header(&mut stream, 2).unwrap();
        receiver.process_packet_data(&TestHandler, 0, &mut stream, 0);
        assert_eq!(receiver.error_level(0), ErrorLevel::FailedToSerialise);
    }
}
