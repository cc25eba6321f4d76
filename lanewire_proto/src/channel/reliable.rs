//! See [`ReliableOrderedChannel`].

use bitvec::{array::BitArray, bitarr};
use bytes::{Bytes, BytesMut};
use lanewire::{ChannelCounter, ChannelKind, ChannelMessage, ErrorLevel};
use tracing::{debug, trace, warn};

use crate::{
    buffer::SeqBuffer,
    seq::Seq,
    stream::{relative_sequence_bits, ReadStream, WriteStream},
};

use super::{ChannelConfig, PacketHandler};

#[derive(Debug, Clone, Default)]
struct MessageSendQueueEntry {
    message: ChannelMessage,
    /// Serialised size reported by the packet handler, for budgeting.
    measured_bits: u32,
    block: bool,
    last_sent: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct MessageReceiveQueueEntry {
    message: ChannelMessage,
}

/// Maps a packet-level ack back to the messages or the block fragment that
/// packet carried.
#[derive(Debug, Clone, Copy, Default)]
struct SentPacketEntry {
    acked: bool,
    block: bool,
    /// Message ids live in the channel's preallocated slab, keyed by the
    /// packet sequence slot.
    num_message_ids: usize,
    block_message_id: u16,
    block_fragment_id: u16,
    time_sent: u64,
}

/// State of the block currently going out over the wire.
///
/// There can be several block messages in the send queue, but only one
/// block is in flight at a time: fragments of the head-of-queue block keep
/// getting included in packets until all of them are acked.
#[derive(Debug, Clone)]
struct SendBlockData {
    active: bool,
    num_fragments: usize,
    num_acked_fragments: usize,
    message_id: u16,
    acked_fragment: BitArray<[u8; 32]>,
    fragment_send_time: Box<[Option<u64>]>,
}

impl SendBlockData {
    fn new(max_fragments: usize) -> Self {
        Self {
            active: false,
            num_fragments: 0,
            num_acked_fragments: 0,
            message_id: 0,
            acked_fragment: bitarr![u8, bitvec::order::Lsb0; 0; 256],
            fragment_send_time: vec![None; max_fragments].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.num_fragments = 0;
        self.num_acked_fragments = 0;
        self.message_id = 0;
        self.acked_fragment.fill(false);
        self.fragment_send_time.fill(None);
    }
}

/// State of the block currently being received.
#[derive(Debug, Clone)]
struct ReceiveBlockData {
    active: bool,
    num_fragments: usize,
    num_received_fragments: usize,
    message_id: u16,
    block_size: u32,
    received_fragment: BitArray<[u8; 32]>,
    /// Scratch of `max_fragments * fragment_size` bytes, preallocated.
    data: Box<[u8]>,
    /// Envelope deserialised from fragment 0.
    message: ChannelMessage,
}

impl ReceiveBlockData {
    fn new(max_fragments: usize, fragment_size: usize) -> Self {
        Self {
            active: false,
            num_fragments: 0,
            num_received_fragments: 0,
            message_id: 0,
            block_size: 0,
            received_fragment: bitarr![u8, bitvec::order::Lsb0; 0; 256],
            data: vec![0; max_fragments * fragment_size].into_boxed_slice(),
            message: ChannelMessage::default(),
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.num_fragments = 0;
        self.num_received_fragments = 0;
        self.message_id = 0;
        self.block_size = 0;
        self.received_fragment.fill(false);
        self.message = ChannelMessage::default();
    }
}

/// Channel delivering messages exactly once, in order.
///
/// Messages stay in the send queue until acked, each acked individually,
/// so the queue can have holes. Small messages are batched into packets
/// and retransmitted on a timer; a block message at the head of the queue
/// switches the channel into block mode, where each packet carries exactly
/// one fragment of the block until every fragment is acked.
///
/// See <https://gafferongames.com/post/reliable_ordered_messages/>.
#[derive(Debug)]
pub struct ReliableOrderedChannel {
    config: ChannelConfig,
    error_level: Box<[ErrorLevel]>,
    /// Id stamped on the next queued message, per connection.
    send_message_ids: Box<[u16]>,
    /// Id of the next message to hand to the application, per connection.
    receive_message_ids: Box<[u16]>,
    /// Id of the oldest unacked message in the send queue, per connection.
    oldest_unacked_message_ids: Box<[u16]>,
    sent_packets: SeqBuffer<SentPacketEntry>,
    send_queue: SeqBuffer<MessageSendQueueEntry>,
    receive_queue: SeqBuffer<MessageReceiveQueueEntry>,
    /// `max_messages_per_packet` ids per sent-packet slot, per connection.
    sent_packet_message_ids: Box<[u16]>,
    send_blocks: Box<[SendBlockData]>,
    receive_blocks: Box<[ReceiveBlockData]>,
    counters: Box<[u64]>,
}

impl ReliableOrderedChannel {
    /// Delivery contract of this channel type.
    pub const KIND: ChannelKind = ChannelKind::ReliableOrdered;

    /// Creates the channel with every queue preallocated.
    ///
    /// # Panics
    ///
    /// Panics if the config is inconsistent; in particular 65536 must be a
    /// multiple of every queue size, so queue slots stay aligned across
    /// sequence wraps.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        config.validate();
        let conns = config.max_connections;
        Self {
            error_level: vec![ErrorLevel::None; conns].into_boxed_slice(),
            send_message_ids: vec![0; conns].into_boxed_slice(),
            receive_message_ids: vec![0; conns].into_boxed_slice(),
            oldest_unacked_message_ids: vec![0; conns].into_boxed_slice(),
            sent_packets: SeqBuffer::new(config.sent_queue_size, conns),
            send_queue: SeqBuffer::new(config.send_queue_size, conns),
            receive_queue: SeqBuffer::new(config.receive_queue_size, conns),
            sent_packet_message_ids: vec![
                0;
                conns * config.sent_queue_size * config.max_messages_per_packet
            ]
            .into_boxed_slice(),
            send_blocks: (0..conns)
                .map(|_| SendBlockData::new(config.max_fragments))
                .collect(),
            receive_blocks: (0..conns)
                .map(|_| ReceiveBlockData::new(config.max_fragments, config.fragment_size))
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

    /// Current error level. A channel that has left [`ErrorLevel::None`]
    /// no-ops every send and receive until reset.
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

    /// Resets one connection slot, releasing its queued messages and
    /// clearing its error level.
    pub fn reset(&mut self, conn: usize) {
        self.error_level[conn] = ErrorLevel::None;
        self.send_message_ids[conn] = 0;
        self.receive_message_ids[conn] = 0;
        self.oldest_unacked_message_ids[conn] = 0;
        self.sent_packets.reset(conn);
        self.send_queue.reset(conn);
        self.receive_queue.reset(conn);
        self.send_blocks[conn].reset();
        self.receive_blocks[conn].reset();
        let range = conn * ChannelCounter::COUNT..(conn + 1) * ChannelCounter::COUNT;
        self.counters[range].fill(0);
    }

    /// Whether the send queue has room for another message.
    #[must_use]
    pub fn can_send(&self, conn: usize) -> bool {
        self.send_queue.available(conn, self.send_message_ids[conn])
    }

    /// Queues `message` for delivery, taking ownership of its payload.
    ///
    /// On a full queue the channel transitions to
    /// [`ErrorLevel::SendQueueFull`] and the message is dropped; on any
    /// non-[`None`](ErrorLevel::None) level the message is dropped
    /// silently.
    pub fn send_message(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        mut message: ChannelMessage,
    ) {
        if self.error_level[conn] != ErrorLevel::None {
            return;
        }

        if !self.can_send(conn) {
            // increase your send queue size!
            self.set_error_level(conn, ErrorLevel::SendQueueFull);
            return;
        }

        let id = self.send_message_ids[conn];
        message.id = id;

        if message.is_block {
            debug_assert!(message.block_size > 0);
            debug_assert!(
                message.block_size as usize
                    <= self.config.max_fragments * self.config.fragment_size
            );
        }

        let measured_bits = handler.message_bits(message.protocol);
        let block = message.is_block;
        let entry = self
            .send_queue
            .insert(conn, id)
            .expect("next send id is never stale");
        entry.message = message;
        entry.measured_bits = measured_bits;
        entry.block = block;
        entry.last_sent = None;

        self.counters[conn * ChannelCounter::COUNT + ChannelCounter::MessagesSent.index()] += 1;
        self.send_message_ids[conn] = id.wrapping_add(1);
    }

    /// Returns the next in-order message, if it has arrived. Ownership of
    /// the payload transfers to the caller.
    pub fn receive_message(&mut self, conn: usize) -> Option<ChannelMessage> {
        if self.error_level[conn] != ErrorLevel::None {
            return None;
        }

        let id = self.receive_message_ids[conn];
        let entry = self.receive_queue.find_mut(conn, id)?;
        let message = std::mem::take(&mut entry.message);
        debug_assert_eq!(message.id, id);
        self.receive_queue.remove(conn, id);

        self.counters[conn * ChannelCounter::COUNT + ChannelCounter::MessagesReceived.index()] += 1;
        self.receive_message_ids[conn] = id.wrapping_add(1);
        Some(message)
    }

    /// Serialises this channel's data for the outgoing packet with
    /// sequence `packet_sequence`, consuming at most `available_bits`.
    ///
    /// Returns the number of bits written; 0 means the channel contributed
    /// nothing to this packet.
    pub fn get_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut WriteStream,
        packet_sequence: u16,
        available_bits: u32,
        now: u64,
    ) -> u32 {
        if self.error_level[conn] != ErrorLevel::None {
            return 0;
        }
        if !self.has_messages_to_send(conn) {
            return 0;
        }

        let channel_index_bits = self.config.channel_index_bits();
        if available_bits <= channel_index_bits {
            return 0;
        }

        if self.sending_block(conn) {
            self.get_fragment_packet_data(handler, conn, stream, packet_sequence, available_bits, now)
        } else {
            self.get_message_packet_data(handler, conn, stream, packet_sequence, available_bits, now)
        }
    }

    /// Processes a packet-level ack: every message (or block fragment) the
    /// packet carried is now confirmed delivered.
    pub fn process_ack(&mut self, conn: usize, packet_sequence: u16) {
        let Some(entry) = self.sent_packets.find_mut(conn, packet_sequence) else {
            return;
        };
        if entry.acked {
            return;
        }
        entry.acked = true;
        let entry = *entry;
        trace!(
            conn,
            packet_sequence,
            time_sent = entry.time_sent,
            "processing packet ack"
        );

        if !entry.block {
            let base = (conn * self.config.sent_queue_size
                + self.sent_packets.index_of(packet_sequence))
                * self.config.max_messages_per_packet;
            for i in 0..entry.num_message_ids {
                let message_id = self.sent_packet_message_ids[base + i];
                if self.send_queue.exists(conn, message_id) {
                    trace!(conn, message_id, "message acked");
                    self.send_queue.remove(conn, message_id);
                    self.update_oldest_unacked(conn);
                }
            }
            return;
        }

        let send_block = &mut self.send_blocks[conn];
        if send_block.active && send_block.message_id == entry.block_message_id {
            let fragment_id = usize::from(entry.block_fragment_id);
            if !send_block.acked_fragment[fragment_id] {
                send_block.acked_fragment.set(fragment_id, true);
                send_block.num_acked_fragments += 1;
                trace!(
                    conn,
                    message_id = entry.block_message_id,
                    fragment_id,
                    acked = send_block.num_acked_fragments,
                    total = send_block.num_fragments,
                    "block fragment acked"
                );
                if send_block.num_acked_fragments == send_block.num_fragments {
                    send_block.active = false;
                    let message_id = entry.block_message_id;
                    debug!(conn, message_id, "block send complete");
                    self.send_queue.remove(conn, message_id);
                    self.update_oldest_unacked(conn);
                }
            }
        }
    }

    /// Deserialises regular message data written by a peer's
    /// [`ReliableOrderedChannel::get_packet_data`].
    ///
    /// The channel-data prefix (channel index, block bit, has-messages
    /// bit) must already have been consumed.
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
        if let Err(level) = self.try_process_packet_data(handler, conn, stream, packet_sequence) {
            self.set_error_level(conn, level);
        }
    }

    /// Deserialises one block fragment written by a peer in block mode.
    pub fn process_packet_fragment(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut ReadStream,
        packet_sequence: u16,
    ) {
        if self.error_level[conn] != ErrorLevel::None {
            return;
        }
        if let Err(level) = self.try_process_packet_fragment(handler, conn, stream, packet_sequence)
        {
            self.set_error_level(conn, level);
        }
    }

    fn try_process_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut ReadStream,
        _packet_sequence: u16,
    ) -> Result<(), ErrorLevel> {
        let min_message_id = self.receive_message_ids[conn];
        let max_message_id =
            min_message_id.wrapping_add((self.config.receive_queue_size - 1) as u16);

        let num_messages = stream
            .read_int(0, self.config.max_messages_per_packet as u64)
            .map_err(|_| ErrorLevel::FailedToSerialise)? as usize;
        if num_messages == 0 {
            return Ok(());
        }

        let mut message_ids = Vec::with_capacity(num_messages);
        let first = stream
            .read_bits(16)
            .map_err(|_| ErrorLevel::FailedToSerialise)? as u16;
        message_ids.push(first);
        for _ in 1..num_messages {
            let previous = *message_ids.last().expect("list is non-empty");
            let id = stream
                .read_sequence_relative(previous)
                .map_err(|_| ErrorLevel::FailedToSerialise)?;
            message_ids.push(id);
        }

        for message_id in message_ids {
            let protocol = stream
                .read_int(0, u64::from(self.config.max_message_protocol))
                .map_err(|_| ErrorLevel::FailedToSerialise)? as u16;

            // the body must be consumed even when the message is skipped,
            // or the rest of the packet goes out of sync
            let mut message = ChannelMessage {
                protocol,
                id: message_id,
                ..ChannelMessage::default()
            };
            handler
                .deserialise_message(&mut message, stream)
                .map_err(|_| ErrorLevel::FailedToSerialise)?;

            if Seq(message_id).before(Seq(min_message_id)) {
                // already delivered
                continue;
            }
            if Seq(message_id).after(Seq(max_message_id)) {
                // did you forget to dequeue messages on the receiver?
                debug!(
                    conn,
                    message_id, min_message_id, max_message_id, "message id overflows window"
                );
                return Err(ErrorLevel::Desync);
            }
            if self.receive_queue.exists(conn, message_id) {
                continue;
            }

            debug_assert!(self.receive_queue.available(conn, message_id));
            let entry = self
                .receive_queue
                .insert(conn, message_id)
                .ok_or(ErrorLevel::Desync)?;
            entry.message = message;
        }

        Ok(())
    }

    fn try_process_packet_fragment(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut ReadStream,
        _packet_sequence: u16,
    ) -> Result<(), ErrorLevel> {
        let message_id = stream
            .read_bits(16)
            .map_err(|_| ErrorLevel::FailedToSerialise)? as u16;
        let num_fragments = if self.config.max_fragments > 1 {
            stream
                .read_int(1, self.config.max_fragments as u64)
                .map_err(|_| ErrorLevel::FailedToSerialise)? as usize
        } else {
            1
        };
        let fragment_id = if num_fragments > 1 {
            stream
                .read_int(0, num_fragments as u64 - 1)
                .map_err(|_| ErrorLevel::FailedToSerialise)? as usize
        } else {
            0
        };
        let fragment_bytes = stream
            .read_int(1, self.config.fragment_size as u64)
            .map_err(|_| ErrorLevel::FailedToSerialise)? as usize;

        let mut fragment = vec![0u8; fragment_bytes];
        stream
            .read_bytes(&mut fragment)
            .map_err(|_| ErrorLevel::FailedToSerialise)?;

        let mut message = ChannelMessage::default();
        if fragment_id == 0 {
            let protocol = stream
                .read_int(0, u64::from(self.config.max_message_protocol))
                .map_err(|_| ErrorLevel::FailedToSerialise)? as u16;
            message.protocol = protocol;
            message.id = message_id;
            handler
                .deserialise_message(&mut message, stream)
                .map_err(|_| ErrorLevel::FailedToSerialise)?;
        }

        if message_id != self.receive_message_ids[conn] {
            // blocks gate on the head of the receive queue; out-of-turn
            // fragments are retransmitted anyway
            trace!(
                conn,
                message_id,
                expected = self.receive_message_ids[conn],
                "dropping out-of-turn block fragment"
            );
            return Ok(());
        }

        let receive_block = &mut self.receive_blocks[conn];
        if !receive_block.active {
            receive_block.active = true;
            receive_block.num_fragments = num_fragments;
            receive_block.num_received_fragments = 0;
            receive_block.message_id = message_id;
            receive_block.block_size = 0;
            receive_block.received_fragment.fill(false);
        }
        debug_assert_eq!(receive_block.message_id, message_id);

        if fragment_id >= receive_block.num_fragments
            || num_fragments != receive_block.num_fragments
        {
            debug!(
                conn,
                fragment_id,
                num_fragments,
                expected = receive_block.num_fragments,
                "impossible block fragment"
            );
            return Err(ErrorLevel::Desync);
        }

        if receive_block.received_fragment[fragment_id] {
            return Ok(());
        }

        receive_block.received_fragment.set(fragment_id, true);
        receive_block.num_received_fragments += 1;

        let fragment_size = self.config.fragment_size;
        receive_block.data[fragment_id * fragment_size..fragment_id * fragment_size + fragment_bytes]
            .copy_from_slice(&fragment);

        if fragment_id == 0 {
            receive_block.message = message;
        }

        if fragment_id == num_fragments - 1 {
            receive_block.block_size =
                ((num_fragments - 1) * fragment_size + fragment_bytes) as u32;
            if receive_block.block_size as usize > self.config.max_fragments * fragment_size {
                return Err(ErrorLevel::Desync);
            }
        }

        trace!(
            conn,
            message_id,
            fragment_id,
            received = receive_block.num_received_fragments,
            total = num_fragments,
            "received block fragment"
        );

        if receive_block.num_received_fragments == receive_block.num_fragments {
            if self
                .receive_queue
                .at_index(conn, self.receive_queue.index_of(message_id))
                .is_some()
            {
                // did you forget to dequeue messages on the receiver?
                return Err(ErrorLevel::Desync);
            }

            let block_size = receive_block.block_size as usize;
            let prefix = receive_block.message.payload.clone();
            let mut combined = BytesMut::with_capacity(prefix.len() + block_size);
            combined.extend_from_slice(&prefix);
            combined.extend_from_slice(&receive_block.data[..block_size]);

            let mut message = std::mem::take(&mut receive_block.message);
            message.id = message_id;
            message.is_block = true;
            message.block_offset = prefix.len() as u16;
            message.block_size = block_size as u32;
            message.payload = combined.freeze();

            receive_block.reset();

            debug!(conn, message_id, block_size, "block receive complete");
            let entry = self
                .receive_queue
                .insert(conn, message_id)
                .ok_or(ErrorLevel::Desync)?;
            entry.message = message;
        }

        Ok(())
    }

    /// Whether any unacked message remains in the send queue.
    fn has_messages_to_send(&self, conn: usize) -> bool {
        self.oldest_unacked_message_ids[conn] != self.send_message_ids[conn]
    }

    /// Whether the head of the send queue is a block message, switching
    /// the channel into block mode.
    fn sending_block(&self, conn: usize) -> bool {
        debug_assert!(self.has_messages_to_send(conn));
        self.send_queue
            .find(conn, self.oldest_unacked_message_ids[conn])
            .is_some_and(|entry| entry.block)
    }

    fn get_message_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut WriteStream,
        packet_sequence: u16,
        available_bits: u32,
        now: u64,
    ) -> u32 {
        let header_bits =
            self.config.channel_index_bits() + 1 + 1 + self.config.num_messages_bits();
        if available_bits < header_bits {
            return 0;
        }
        let mut budget = available_bits - header_bits;
        if let Some(packet_budget) = self.config.packet_budget {
            budget = budget.min(packet_budget as u32 * 8);
        }

        let message_ids = self.collect_messages_to_send(conn, budget, now);
        if message_ids.is_empty() {
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
            message_ids.len() as u64,
            0,
            self.config.max_messages_per_packet as u64,
        );

        stream.write_bits(u32::from(message_ids[0]), 16);
        for pair in message_ids.windows(2) {
            stream.write_sequence_relative(pair[0], pair[1]);
        }

        for &message_id in &message_ids {
            let entry = self
                .send_queue
                .find(conn, message_id)
                .expect("selected message is in the send queue");
            stream.write_int(
                u64::from(entry.message.protocol),
                0,
                u64::from(self.config.max_message_protocol),
            );
            handler.serialise_message(&entry.message, stream);
        }

        self.add_message_packet_entry(conn, &message_ids, packet_sequence, now);

        stream.bits_processed() - bits_before
    }

    /// Walks the send queue from the oldest unacked id, collecting regular
    /// messages that are due for (re)send and fit in `budget` bits.
    ///
    /// Stops at the first block message, at the packet's message cap, and
    /// after too many messages in a row failed to fit.
    fn collect_messages_to_send(&mut self, conn: usize, budget: u32, now: u64) -> Vec<u16> {
        let message_limit = self
            .config
            .send_queue_size
            .min(self.config.receive_queue_size);
        let protocol_bits = self.config.protocol_bits();
        let give_up_bits = protocol_bits + 4 * 8;

        let mut message_ids = Vec::new();
        let mut previous_id = 0u16;
        let mut used_bits = 0u32;
        let mut give_up_counter = 0usize;

        for i in 0..message_limit {
            if budget.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            if give_up_counter > self.config.send_queue_size {
                break;
            }

            let message_id = self.oldest_unacked_message_ids[conn].wrapping_add(i as u16);
            let Some(entry) = self.send_queue.find_mut(conn, message_id) else {
                continue;
            };

            if entry.block {
                break;
            }

            let due = entry
                .last_sent
                .map_or(true, |t| t + self.config.message_resend_time_ms <= now);
            if due && budget >= entry.measured_bits {
                let mut message_bits = entry.measured_bits + protocol_bits;
                if message_ids.is_empty() {
                    message_bits += 16;
                } else {
                    message_bits += relative_sequence_bits(previous_id, message_id);
                }

                if used_bits + message_bits > budget {
                    give_up_counter += 1;
                    continue;
                }

                used_bits += message_bits;
                previous_id = message_id;
                entry.last_sent = Some(now);
                message_ids.push(message_id);
            }

            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        message_ids
    }

    fn add_message_packet_entry(
        &mut self,
        conn: usize,
        message_ids: &[u16],
        packet_sequence: u16,
        now: u64,
    ) {
        let slot = self.sent_packets.index_of(packet_sequence);
        let Some(entry) = self.sent_packets.insert(conn, packet_sequence) else {
            return;
        };
        entry.acked = false;
        entry.block = false;
        entry.time_sent = now;
        entry.num_message_ids = message_ids.len();
        entry.block_message_id = 0;
        entry.block_fragment_id = 0;

        let base =
            (conn * self.config.sent_queue_size + slot) * self.config.max_messages_per_packet;
        self.sent_packet_message_ids[base..base + message_ids.len()].copy_from_slice(message_ids);
    }

    fn get_fragment_packet_data(
        &mut self,
        handler: &impl PacketHandler,
        conn: usize,
        stream: &mut WriteStream,
        packet_sequence: u16,
        available_bits: u32,
        now: u64,
    ) -> u32 {
        // worst-case framing around one full fragment
        let overhead = self.config.channel_index_bits()
            + 1
            + 16
            + crate::bits::bits_required(1, self.config.max_fragments as u64)
            + crate::bits::bits_required(0, self.config.max_fragments as u64 - 1)
            + crate::bits::bits_required(1, self.config.fragment_size as u64)
            + 7;
        let fragment_bits = self.config.fragment_size as u32 * 8;
        if available_bits < overhead + fragment_bits {
            return 0;
        }

        let Some(next) = self.next_fragment_to_send(conn, available_bits, now) else {
            return 0;
        };
        let (message_id, fragment_id, num_fragments, fragment) = next;

        let bits_before = stream.bits_processed();

        stream.write_int(
            self.config.channel_index as u64,
            0,
            self.config.num_channels as u64 - 1,
        );
        stream.write_bits(1, 1);
        stream.write_bits(u32::from(message_id), 16);
        if self.config.max_fragments > 1 {
            stream.write_int(num_fragments as u64, 1, self.config.max_fragments as u64);
        }
        if num_fragments > 1 {
            stream.write_int(fragment_id as u64, 0, num_fragments as u64 - 1);
        }
        stream.write_int(fragment.len() as u64, 1, self.config.fragment_size as u64);
        stream.write_bytes(&fragment);

        if fragment_id == 0 {
            let entry = self
                .send_queue
                .find(conn, message_id)
                .expect("block message is in the send queue");
            stream.write_int(
                u64::from(entry.message.protocol),
                0,
                u64::from(self.config.max_message_protocol),
            );
            handler.serialise_message(&entry.message, stream);
        }

        self.add_fragment_packet_entry(conn, message_id, fragment_id as u16, packet_sequence, now);

        stream.bits_processed() - bits_before
    }

    /// Picks the next fragment of the in-flight block that is unacked and
    /// due for (re)send, activating the block on first use.
    fn next_fragment_to_send(
        &mut self,
        conn: usize,
        available_bits: u32,
        now: u64,
    ) -> Option<(u16, usize, usize, Bytes)> {
        let entry = self
            .send_queue
            .find(conn, self.oldest_unacked_message_ids[conn])
            .expect("head of queue is a block message");
        debug_assert!(entry.block);
        let message_id = entry.message.id;
        let block_size = entry.message.block_size as usize;
        let measured_bits = entry.measured_bits;
        let block = entry.message.block();

        let send_block = &mut self.send_blocks[conn];
        if !send_block.active {
            send_block.active = true;
            send_block.message_id = message_id;
            send_block.num_fragments = block_size.div_ceil(self.config.fragment_size);
            send_block.num_acked_fragments = 0;
            send_block.acked_fragment.fill(false);
            send_block.fragment_send_time.fill(None);

            debug_assert!(send_block.num_fragments > 0);
            debug_assert!(send_block.num_fragments <= self.config.max_fragments);
            debug!(
                conn,
                message_id,
                block_size,
                num_fragments = send_block.num_fragments,
                "block send starting"
            );
        }

        let fragment_id = (0..send_block.num_fragments).find(|&i| {
            !send_block.acked_fragment[i]
                && send_block.fragment_send_time[i]
                    .map_or(true, |t| t + self.config.fragment_resend_time_ms < now)
        })?;

        if fragment_id == 0
            && available_bits < measured_bits + self.config.protocol_bits()
        {
            return None;
        }

        let fragment_size = self.config.fragment_size;
        let mut fragment_bytes = fragment_size;
        let remainder = block_size % fragment_size;
        if remainder != 0 && fragment_id == send_block.num_fragments - 1 {
            fragment_bytes = remainder;
        }

        let fragment = block.slice(fragment_id * fragment_size..fragment_id * fragment_size + fragment_bytes);
        send_block.fragment_send_time[fragment_id] = Some(now);

        Some((message_id, fragment_id, send_block.num_fragments, fragment))
    }

    fn add_fragment_packet_entry(
        &mut self,
        conn: usize,
        message_id: u16,
        fragment_id: u16,
        packet_sequence: u16,
        now: u64,
    ) {
        let Some(entry) = self.sent_packets.insert(conn, packet_sequence) else {
            return;
        };
        entry.acked = false;
        entry.block = true;
        entry.time_sent = now;
        entry.num_message_ids = 0;
        entry.block_message_id = message_id;
        entry.block_fragment_id = fragment_id;
    }

    /// Walks the oldest-unacked id forward past the hole left by acked
    /// messages. The send queue is not a true queue - messages are acked
    /// individually - so this must re-scan after every removal.
    fn update_oldest_unacked(&mut self, conn: usize) {
        let stop_id = self.send_message_ids[conn];
        let mut oldest = self.oldest_unacked_message_ids[conn];
        while oldest != stop_id && !self.send_queue.exists(conn, oldest) {
            oldest = oldest.wrapping_add(1);
        }
        self.oldest_unacked_message_ids[conn] = oldest;
        debug_assert!(!Seq(oldest).after(Seq(stop_id)));
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

    /// One direction of a link: packs the sender's channel data into a
    /// "packet", optionally delivers it, and feeds acks back.
    struct Link {
        sender: ReliableOrderedChannel,
        receiver: ReliableOrderedChannel,
        handler: TestHandler,
        packet_sequence: u16,
    }

    impl Link {
        fn new(config: ChannelConfig) -> Self {
            Self {
                sender: ReliableOrderedChannel::new(config.clone()),
                receiver: ReliableOrderedChannel::new(config),
                handler: TestHandler,
                packet_sequence: 0,
            }
        }

        /// Packs one packet; returns its sequence and serialised channel
        /// data, or [`None`] if the channel had nothing to say.
        fn pack(&mut self, now: u64) -> Option<(u16, Vec<u8>)> {
            let mut stream = WriteStream::new(17 * 1024);
            let sequence = self.packet_sequence;
            let bits = self.sender.get_packet_data(
                &self.handler,
                0,
                &mut stream,
                sequence,
                AVAILABLE_BITS,
                now,
            );
            if bits == 0 {
                return None;
            }
            self.packet_sequence = self.packet_sequence.wrapping_add(1);
            stream.flush();
            Some((sequence, stream.as_bytes().to_vec()))
        }

        /// Delivers packed channel data to the receiver and acks it back
        /// to the sender.
        fn deliver(&mut self, sequence: u16, data: &[u8]) {
            let mut stream = ReadStream::new(data);
            let (index, kind) =
                read_channel_header(&mut stream, self.sender.config().num_channels).unwrap();
            assert_eq!(index, 0);
            match kind {
                ChannelData::Messages => {
                    self.receiver
                        .process_packet_data(&self.handler, 0, &mut stream, sequence);
                }
                ChannelData::Fragment => {
                    self.receiver
                        .process_packet_fragment(&self.handler, 0, &mut stream, sequence);
                }
                ChannelData::Empty => {}
            }
            self.sender.process_ack(0, sequence);
        }

        fn drain(&mut self) -> Vec<ChannelMessage> {
            std::iter::from_fn(|| self.receiver.receive_message(0)).collect()
        }
    }

    #[test]
    fn in_order_delivery() {
        let mut link = Link::new(config());
        for i in 0..10u16 {
            link.sender
                .send_message(&TestHandler, 0, message(i, &i.to_le_bytes()));
        }
        let (sequence, data) = link.pack(1000).unwrap();
        link.deliver(sequence, &data);

        let received = link.drain();
        assert_eq!(received.len(), 10);
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.id, i as u16);
            assert_eq!(msg.protocol, i as u16);
            assert_eq!(msg.payload.as_ref(), (i as u16).to_le_bytes());
        }
        assert_eq!(
            link.receiver.counter(0, ChannelCounter::MessagesReceived),
            10
        );

        // everything acked: nothing left to send
        assert_matches!(link.pack(2000), None);
    }

    #[test]
    fn dropped_packet_is_resent() {
        let mut link = Link::new(config());
        let mut now = 1000;

        for i in 0..10u16 {
            link.sender
                .send_message(&TestHandler, 0, message(0, &[i as u8]));
        }

        // first transmission is lost
        let (_, _) = link.pack(now).unwrap();

        // not yet due for resend
        now += 50;
        assert_matches!(link.pack(now), None);

        // due: the same messages go out again and arrive in order
        now += 50;
        let (sequence, data) = link.pack(now).unwrap();
        link.deliver(sequence, &data);

        let received = link.drain();
        assert_eq!(received.len(), 10);
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.payload.as_ref(), [i as u8]);
        }
    }

    #[test]
    fn duplicate_delivery_received_once() {
        let mut link = Link::new(config());
        link.sender
            .send_message(&TestHandler, 0, message(7, b"once"));

        let (sequence, data) = link.pack(1000).unwrap();
        link.deliver(sequence, &data);
        // the network duplicates the packet
        link.deliver(sequence, &data);

        let received = link.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload.as_ref(), b"once");
    }

    #[test]
    fn lossy_link_delivers_everything_in_order() {
        // deterministic loss: every 4th packet vanishes
        let mut link = Link::new(config());
        let mut now = 1000u64;
        let total = 40u16;
        let mut sent = 0u16;
        let mut received = Vec::new();

        for round in 0..200 {
            if sent < total {
                link.sender
                    .send_message(&TestHandler, 0, message(sent, &sent.to_le_bytes()));
                sent += 1;
            }
            if let Some((sequence, data)) = link.pack(now) {
                if round % 4 != 3 {
                    link.deliver(sequence, &data);
                }
            }
            received.extend(link.drain());
            now += 37;
            if received.len() == usize::from(total) {
                break;
            }
        }

        assert_eq!(received.len(), usize::from(total));
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.id, i as u16, "message {i} out of order");
            assert_eq!(msg.payload.as_ref(), (i as u16).to_le_bytes());
        }
    }

    #[test]
    fn block_transfer() {
        let mut link = Link::new(config());
        let prefix = b"hdr!";
        let block: Vec<u8> = (0..3000u32).map(|i| (i * 3) as u8).collect();
        let mut payload = prefix.to_vec();
        payload.extend_from_slice(&block);
        let msg = ChannelMessage::with_block(
            42,
            Bytes::from(payload.clone()),
            prefix.len() as u16,
            block.len() as u32,
        );
        link.sender.send_message(&TestHandler, 0, msg);

        // one fragment per packet: 3000 bytes / 1024 = 3 fragments
        let mut packets = Vec::new();
        for _ in 0..3 {
            packets.push(link.pack(1000).expect("one fragment per packet"));
        }
        // all in flight, nothing more to send right now
        assert_matches!(link.pack(1000), None);

        for (sequence, data) in &packets {
            link.deliver(*sequence, data);
        }

        let received = link.drain();
        assert_eq!(received.len(), 1);
        let msg = &received[0];
        assert!(msg.is_block);
        assert_eq!(msg.protocol, 42);
        assert_eq!(msg.block_offset, prefix.len() as u16);
        assert_eq!(msg.block_size, block.len() as u32);
        assert_eq!(msg.payload.as_ref(), payload);

        // the block is fully acked: the channel is idle again
        assert_matches!(link.pack(2000), None);
    }

    #[test]
    fn lost_block_fragment_is_resent() {
        let mut link = Link::new(config());
        let block: Vec<u8> = vec![0xCD; 2500];
        let msg =
            ChannelMessage::with_block(1, Bytes::from(block.clone()), 0, block.len() as u32);
        link.sender.send_message(&TestHandler, 0, msg);

        let mut now = 1000;
        let mut packets = Vec::new();
        for _ in 0..3 {
            packets.push(link.pack(now).unwrap());
        }

        // fragment 1 is lost; the others arrive and are acked
        for (i, (sequence, data)) in packets.iter().enumerate() {
            if i != 1 {
                link.deliver(*sequence, data);
            }
        }
        assert!(link.drain().is_empty());

        now += 251;
        let (sequence, data) = link.pack(now).expect("fragment 1 due for resend");
        link.deliver(sequence, &data);

        let received = link.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload.as_ref(), block);
    }

    #[test]
    fn send_queue_full_is_terminal() {
        let mut channel = ReliableOrderedChannel::new(ChannelConfig {
            max_connections: 1,
            send_queue_size: 8,
            ..ChannelConfig::default()
        });
        for i in 0..8u16 {
            channel.send_message(&TestHandler, 0, message(0, &[i as u8]));
        }
        assert_eq!(channel.error_level(0), ErrorLevel::None);
        assert!(!channel.can_send(0));

        channel.send_message(&TestHandler, 0, message(0, b"overflow"));
        assert_eq!(channel.error_level(0), ErrorLevel::SendQueueFull);

        // terminal until reset
        let mut stream = WriteStream::new(1024);
        assert_eq!(
            channel.get_packet_data(&TestHandler, 0, &mut stream, 0, AVAILABLE_BITS, 0),
            0
        );
        channel.reset(0);
        assert_eq!(channel.error_level(0), ErrorLevel::None);
        assert!(channel.can_send(0));
    }

    #[test]
    fn receiver_overflow_desyncs() {
        // mismatched configs: the sender believes the receiver can buffer
        // more than it actually can
        let mut sender = ReliableOrderedChannel::new(ChannelConfig {
            max_connections: 1,
            send_queue_size: 16,
            receive_queue_size: 16,
            ..ChannelConfig::default()
        });
        let mut receiver = ReliableOrderedChannel::new(ChannelConfig {
            max_connections: 1,
            send_queue_size: 16,
            receive_queue_size: 8,
            ..ChannelConfig::default()
        });
        for i in 0..10u16 {
            sender.send_message(&TestHandler, 0, message(0, &[i as u8]));
        }

        let mut stream = WriteStream::new(17 * 1024);
        let bits = sender.get_packet_data(&TestHandler, 0, &mut stream, 0, AVAILABLE_BITS, 1000);
        assert!(bits > 0);
        stream.flush();
        let data = stream.as_bytes().to_vec();

        let mut stream = ReadStream::new(&data);
        let (_, kind) = read_channel_header(&mut stream, 2).unwrap();
        assert_eq!(kind, ChannelData::Messages);
        // the receiver never dequeues, and ids 8.. overflow its window
        receiver.process_packet_data(&TestHandler, 0, &mut stream, 0);
        assert_eq!(receiver.error_level(0), ErrorLevel::Desync);
        assert_matches!(receiver.receive_message(0), None);
    }

    #[test]
    fn truncated_data_fails_to_serialise() {
        let mut link = Link::new(config());
        link.sender
            .send_message(&TestHandler, 0, message(3, b"truncate me"));
        let (sequence, data) = link.pack(1000).unwrap();

        let mut stream = ReadStream::new(&data[..data.len() / 2]);
        let (_, kind) = read_channel_header(&mut stream, 2).unwrap();
        assert_eq!(kind, ChannelData::Messages);
        link.receiver
            .process_packet_data(&TestHandler, 0, &mut stream, sequence);
        assert_eq!(link.receiver.error_level(0), ErrorLevel::FailedToSerialise);
    }

    #[test]
    fn regular_messages_wait_behind_block() {
        let mut link = Link::new(config());
        let block = vec![1u8; 2048];
        link.sender.send_message(
            &TestHandler,
            0,
            ChannelMessage::with_block(9, Bytes::from(block), 0, 2048),
        );
        link.sender
            .send_message(&TestHandler, 0, message(10, b"after"));

        // while the block is unacked, only fragments go out
        let (s0, d0) = link.pack(1000).unwrap();
        let (s1, d1) = link.pack(1000).unwrap();
        assert_matches!(link.pack(1000), None);
        link.deliver(s0, &d0);
        link.deliver(s1, &d1);

        // block acked and delivered: the regular message follows
        let (s2, d2) = link.pack(1100).unwrap();
        link.deliver(s2, &d2);

        let received = link.drain();
        assert_eq!(received.len(), 2);
        assert!(received[0].is_block);
        assert_eq!(received[1].payload.as_ref(), b"after");
    }
}
