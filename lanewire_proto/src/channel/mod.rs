//! Message channels multiplexed over one connection.
//!
//! A channel turns whole packets into application-level messages with a
//! per-channel delivery contract: [`ReliableOrderedChannel`] retransmits
//! and reorders, [`UnreliableUnorderedChannel`] queues whatever arrives,
//! and [`UnreliableProcessChannel`] hands arrivals straight to a callback.
//!
//! # Wire layout
//!
//! Each channel contributes one block of channel data to a packet payload:
//!
//! ```text
//! [channel index | block bit | ...]
//! block bit = 0: [has-messages bit | message data]
//! block bit = 1: [fragment data]          (reliable-ordered only)
//! ```
//!
//! The application demultiplexes a payload by reading the prefix with
//! [`read_channel_header`] and handing the stream to the right channel's
//! `process_packet_data` or `process_packet_fragment`.

mod process;
mod reliable;
mod unreliable;

pub use {process::*, reliable::*, unreliable::*};

use lanewire::ChannelMessage;

use crate::{
    bits::bits_required,
    stream::{ReadStream, StreamError, WriteStream},
};

/// Serialises and measures application messages for the channels.
///
/// The channels own the envelope and the framing; the handler owns the
/// protocol-specific body. For a block message, the handler serialises
/// only the message prefix - the block part travels as channel fragments.
pub trait PacketHandler {
    /// Upper bound on the serialised size of a message of this protocol,
    /// in bits, excluding the block part.
    fn message_bits(&self, protocol: u16) -> u32;

    /// Writes the body of `message` into the stream.
    fn serialise_message(&self, message: &ChannelMessage, stream: &mut WriteStream);

    /// Mirror of [`PacketHandler::serialise_message`]: reads the body into
    /// `message`, whose `protocol` and `id` are already filled in.
    ///
    /// # Errors
    ///
    /// Propagates stream errors on truncated or corrupted input.
    fn deserialise_message(
        &self,
        message: &mut ChannelMessage,
        stream: &mut ReadStream,
    ) -> Result<(), StreamError>;
}

/// What follows a channel-data prefix in a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelData {
    /// Regular message data; hand to `process_packet_data`.
    Messages,
    /// A block fragment; hand to `process_packet_fragment`.
    Fragment,
    /// The has-messages bit was clear; nothing follows for this channel.
    Empty,
}

/// Reads one channel-data prefix: the channel index, the block bit, and
/// (for non-block data) the has-messages bit.
///
/// # Errors
///
/// Propagates stream errors on truncated input.
pub fn read_channel_header(
    stream: &mut ReadStream,
    num_channels: usize,
) -> Result<(usize, ChannelData), StreamError> {
    debug_assert!(num_channels > 1);
    let channel_index = stream.read_int(0, num_channels as u64 - 1)? as usize;
    if stream.read_bool()? {
        return Ok((channel_index, ChannelData::Fragment));
    }
    if stream.read_bool()? {
        Ok((channel_index, ChannelData::Messages))
    } else {
        Ok((channel_index, ChannelData::Empty))
    }
}

/// Configuration of one channel, shared by both peers at compile time.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of connection slots.
    pub max_connections: usize,
    /// Total channels multiplexed over the connection; sizes the
    /// channel-index field on the wire.
    pub num_channels: usize,
    /// Index of this channel in `[0, num_channels)`.
    pub channel_index: usize,
    /// Capacity of the send queue.
    ///
    /// For the reliable-ordered channel, 65536 must be a multiple of this.
    pub send_queue_size: usize,
    /// Capacity of the receive queue. Same divisibility rule.
    pub receive_queue_size: usize,
    /// Capacity of the sent-packet record buffer (reliable-ordered only).
    /// Same divisibility rule; size for at least a few seconds of packets.
    pub sent_queue_size: usize,
    /// Most messages serialised into one packet's channel data.
    pub max_messages_per_packet: usize,
    /// Optional hard cap, in bytes, on this channel's data per packet.
    pub packet_budget: Option<usize>,
    /// Largest protocol discriminant in use; sizes the protocol field.
    pub max_message_protocol: u16,
    /// Most fragments a block message may be split into.
    pub max_fragments: usize,
    /// Bytes of block payload per fragment.
    pub fragment_size: usize,
    /// A message is retransmitted when this much time has passed since it
    /// was last serialised into a packet.
    pub message_resend_time_ms: u64,
    /// Same, for block fragments.
    pub fragment_resend_time_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            num_channels: 2,
            channel_index: 0,
            send_queue_size: 512,
            receive_queue_size: 512,
            sent_queue_size: 512,
            max_messages_per_packet: 256,
            packet_budget: None,
            max_message_protocol: u16::MAX,
            max_fragments: 16,
            fragment_size: 1024,
            message_resend_time_ms: 100,
            fragment_resend_time_ms: 250,
        }
    }
}

impl ChannelConfig {
    pub(crate) fn channel_index_bits(&self) -> u32 {
        bits_required(0, self.num_channels as u64 - 1)
    }

    pub(crate) fn num_messages_bits(&self) -> u32 {
        bits_required(0, self.max_messages_per_packet as u64)
    }

    pub(crate) fn protocol_bits(&self) -> u32 {
        bits_required(0, u64::from(self.max_message_protocol))
    }

    pub(crate) fn validate(&self) {
        assert!(self.max_connections > 0);
        assert!(self.num_channels > 1);
        assert!(self.channel_index < self.num_channels);
        assert!(self.send_queue_size > 0 && 65536 % self.send_queue_size == 0);
        assert!(self.receive_queue_size > 0 && 65536 % self.receive_queue_size == 0);
        assert!(self.sent_queue_size > 0 && 65536 % self.sent_queue_size == 0);
        assert!(self.max_messages_per_packet > 0);
        assert!(self.max_fragments > 0 && self.max_fragments <= 256);
        assert!(self.fragment_size > 0);
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use bytes::{Bytes, BytesMut};
    use lanewire::ChannelMessage;

    use crate::stream::{ReadStream, StreamError, WriteStream};

    use super::PacketHandler;

    /// Frames every message body as a 16-bit length followed by the raw
    /// bytes; block messages carry `[is_block, block_offset]` in front so
    /// the receive side can rebuild the envelope.
    #[derive(Debug, Default)]
    pub struct TestHandler;

    impl PacketHandler for TestHandler {
        fn message_bits(&self, _protocol: u16) -> u32 {
            // 1 + 16 + 16 bit framing, 256 bytes of prefix, alignment slack
            (1 + 16 + 16) + 256 * 8 + 16
        }

        fn serialise_message(&self, message: &ChannelMessage, stream: &mut WriteStream) {
            stream.write_bool(message.is_block);
            if message.is_block {
                stream.write_bits(u32::from(message.block_offset), 16);
            }
            let prefix = message.prefix();
            stream.write_bits(prefix.len() as u32, 16);
            if !prefix.is_empty() {
                stream.write_bytes(&prefix);
            }
        }

        fn deserialise_message(
            &self,
            message: &mut ChannelMessage,
            stream: &mut ReadStream,
        ) -> Result<(), StreamError> {
            message.is_block = stream.read_bool()?;
            if message.is_block {
                message.block_offset = stream.read_bits(16)? as u16;
            }
            let len = stream.read_bits(16)? as usize;
            let mut payload = BytesMut::zeroed(len);
            if len > 0 {
                stream.read_bytes(&mut payload)?;
            }
            message.payload = payload.freeze();
            Ok(())
        }
    }

    pub fn message(protocol: u16, payload: &[u8]) -> ChannelMessage {
        ChannelMessage::new(protocol, Bytes::copy_from_slice(payload))
    }
}
