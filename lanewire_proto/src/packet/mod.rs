//! Wire headers for packets and fragments.
//!
//! A datagram on the wire is either a *regular packet* - a variable-length
//! 4 to 9 byte header followed by the payload - or a *fragment* of a larger
//! packet - a fixed 5 byte header followed by a slice of the payload.
//! Byte 0 bit 0 distinguishes the two shapes. All multi-byte integers are
//! little-endian.
//!
//! The regular header is kept small in the common case (all of the last 32
//! packets received, ack close to the sequence) by a prefix byte whose bits
//! flag which parts follow:
//!
//! - bit 0: 0 for regular, 1 for fragment
//! - bits 1..=4: the corresponding byte of `ack_bits` differs from `0xFF`
//!   and follows explicitly; omitted bytes are reconstructed as `0xFF`
//! - bit 5: the ack is encoded as a one-byte delta below the sequence
//!   rather than a two-byte absolute value

mod header;

pub use header::*;

/// Smallest regular packet header: prefix, sequence, one-byte ack delta.
pub const MIN_PACKET_HEADER_BYTES: usize = 4;
/// Largest regular packet header: prefix, sequence, absolute ack, four
/// explicit ack-bits bytes.
pub const MAX_PACKET_HEADER_BYTES: usize = 9;
/// Fixed fragment header size: prefix, sequence, fragment id, fragment
/// count minus one.
pub const FRAGMENT_HEADER_BYTES: usize = 5;

/// Error of a header decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The buffer is too small to hold the header it claims to contain.
    #[error("packet too small for header")]
    TooShort,
    /// The prefix byte does not indicate the expected wire shape.
    #[error("unexpected prefix byte")]
    BadPrefix,
    /// The fragment count is larger than the configured maximum.
    #[error("{num_fragments} fragments, at most {max} allowed")]
    TooManyFragments {
        /// Fragment count in the header.
        num_fragments: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The fragment id is not below the fragment count.
    #[error("fragment id {fragment_id} out of range of {num_fragments} fragments")]
    FragmentIdOutOfRange {
        /// Fragment id in the header.
        fragment_id: usize,
        /// Fragment count in the header.
        num_fragments: usize,
    },
    /// Fragment 0 embeds a packet header whose sequence differs from the
    /// fragment's own.
    #[error("embedded sequence {embedded} does not match fragment sequence {sequence}")]
    SequenceMismatch {
        /// Sequence of the embedded packet header.
        embedded: u16,
        /// Sequence of the fragment header.
        sequence: u16,
    },
    /// The fragment payload is larger than the configured fragment size.
    #[error("fragment payload of {len} bytes exceeds fragment size {max}")]
    FragmentTooLarge {
        /// Payload length in this datagram.
        len: usize,
        /// Configured fragment size.
        max: usize,
    },
    /// A non-final fragment's payload is not exactly the fragment size.
    #[error("non-final fragment payload of {len} bytes, expected exactly {expected}")]
    BadFragmentLen {
        /// Payload length in this datagram.
        len: usize,
        /// Configured fragment size.
        expected: usize,
    },
}
