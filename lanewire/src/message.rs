//! See [`ChannelMessage`].

use bytes::Bytes;

/// Envelope for an application-level message travelling over a channel.
///
/// The envelope carries the user-defined protocol discriminant, the channel
/// sequence id stamped by the channel (for unreliable channels, the sequence
/// of the packet the message arrived in), and the payload bytes.
///
/// # Block messages
///
/// A message whose payload exceeds the per-packet budget of a
/// reliable-ordered channel is flagged as a *block*. Its payload is laid out
/// as `[message prefix of block_offset bytes][block of block_size bytes]`:
/// the prefix is the part serialised through the packet handler with
/// fragment 0, and the block part is transmitted as fragments.
///
/// # Ownership
///
/// The payload has a single holder at all times. Queueing a message into a
/// channel hands the payload to the channel; dequeuing one hands it to the
/// caller. [`Bytes`] makes the fragment slicing on the send side free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMessage {
    /// User-defined protocol discriminant, dispatched on by the packet
    /// handler.
    pub protocol: u16,
    /// Channel sequence id. Stamped by the channel on send; on unreliable
    /// channels this is the sequence of the packet the message arrived in.
    pub id: u16,
    /// Whether this message carries a block payload.
    pub is_block: bool,
    /// Offset from the start of `payload` at which the block part begins.
    pub block_offset: u16,
    /// Size of the block part in bytes.
    pub block_size: u32,
    /// Payload bytes.
    pub payload: Bytes,
}

impl ChannelMessage {
    /// Creates a regular (non-block) message.
    #[must_use]
    pub fn new(protocol: u16, payload: Bytes) -> Self {
        Self {
            protocol,
            payload,
            ..Self::default()
        }
    }

    /// Creates a block message.
    ///
    /// `payload` must be laid out as
    /// `[prefix of block_offset bytes][block of block_size bytes]`.
    ///
    /// # Panics
    ///
    /// Panics if the payload is shorter than `block_offset + block_size`.
    #[must_use]
    pub fn with_block(protocol: u16, payload: Bytes, block_offset: u16, block_size: u32) -> Self {
        assert!(payload.len() >= usize::from(block_offset) + block_size as usize);
        Self {
            protocol,
            id: 0,
            is_block: true,
            block_offset,
            block_size,
            payload,
        }
    }

    /// Bytes of the message prefix, i.e. the part before the block.
    ///
    /// For a regular message this is the whole payload.
    #[must_use]
    pub fn prefix(&self) -> Bytes {
        if self.is_block {
            self.payload.slice(..usize::from(self.block_offset))
        } else {
            self.payload.clone()
        }
    }

    /// Bytes of the block part of the payload.
    ///
    /// Empty for a regular message.
    #[must_use]
    pub fn block(&self) -> Bytes {
        if self.is_block {
            let start = usize::from(self.block_offset);
            self.payload.slice(start..start + self.block_size as usize)
        } else {
            Bytes::new()
        }
    }
}
