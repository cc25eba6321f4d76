//! See [`UnreliableProcessChannel`].

use crossbeam::queue::ArrayQueue;
use lanewire::{ChannelCounter, ChannelKind, ChannelMessage, ConnectionManager, ErrorLevel};
use tracing::{trace, warn};

use crate::stream::{ReadStream, WriteStream};

use super::{ChannelConfig, PacketHandler};

/// Channel delivering messages at most once, straight into a callback.
///
/// The send side is identical to
/// [`UnreliableUnorderedChannel`](super::UnreliableUnorderedChannel). On
/// the receive side there is no queue at all: each arrival is handed to
/// [`ConnectionManager::handle_unreliable`] synchronously during packet
/// processing and dropped when the callback returns.
///
/// Meant for data whose information content is only valid for a moment -
/// if it arrives late, out of order, or not at all, the right response is
/// to do nothing, and buffering would only add latency. The application
/// handles reordering itself, e.g. by discarding updates older than the
/// newest one seen.
#[derive(Debug)]
pub struct UnreliableProcessChannel {
    config: ChannelConfig,
    error_level: Box<[ErrorLevel]>,
    send_queue: Box<[ArrayQueue<ChannelMessage>]>,
    counters: Box<[u64]>,
}

impl UnreliableProcessChannel {
    /// Delivery contract of this channel type.
    pub const KIND: ChannelKind = ChannelKind::UnreliableProcess;

    /// Creates the channel with the send ring preallocated.
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

    /// Serialises as many queued messages as fit in `available_bits`;
    /// messages that do not fit are dropped.
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

    /// Deserialises message data written by a peer and hands each message
    /// to [`ConnectionManager::handle_unreliable`].
    ///
    /// The envelope and payload are dropped when the callback returns; the
    /// callback must copy anything it wants to keep.
    pub fn process_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        manager: &mut impl ConnectionManager,
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
                manager.handle_unreliable(conn, message);
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
