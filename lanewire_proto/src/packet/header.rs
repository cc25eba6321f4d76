//! See [`PacketHeader`] and [`FragmentHeader`].

use bytes::{Buf, BufMut};

use super::{
    HeaderError, FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES, MIN_PACKET_HEADER_BYTES,
};

/// Header of a regular (non-fragment) packet.
///
/// Encodes to 4-9 bytes depending on how compressible the acknowledgement
/// state is; see the [module docs](crate::packet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sequence number of this packet.
    pub sequence: u16,
    /// Most recent packet sequence received from the peer.
    pub ack: u16,
    /// Bit `i` set iff packet `ack - i` was received from the peer.
    pub ack_bits: u32,
}

impl PacketHeader {
    /// Encodes this header into the front of `buf` and returns the encoded
    /// length.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`MAX_PACKET_HEADER_BYTES`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= MAX_PACKET_HEADER_BYTES);
        let total = buf.len();
        let mut dst = buf;

        let mut prefix = 0u8;
        if self.ack_bits & 0x0000_00FF != 0x0000_00FF {
            prefix |= 1 << 1;
        }
        if self.ack_bits & 0x0000_FF00 != 0x0000_FF00 {
            prefix |= 1 << 2;
        }
        if self.ack_bits & 0x00FF_0000 != 0x00FF_0000 {
            prefix |= 1 << 3;
        }
        if self.ack_bits & 0xFF00_0000 != 0xFF00_0000 {
            prefix |= 1 << 4;
        }

        let sequence_difference = self.sequence.wrapping_sub(self.ack);
        if sequence_difference <= 255 {
            prefix |= 1 << 5;
        }

        dst.put_u8(prefix);
        dst.put_u16_le(self.sequence);

        if sequence_difference <= 255 {
            dst.put_u8(sequence_difference as u8);
        } else {
            dst.put_u16_le(self.ack);
        }

        if prefix & (1 << 1) != 0 {
            dst.put_u8(self.ack_bits as u8);
        }
        if prefix & (1 << 2) != 0 {
            dst.put_u8((self.ack_bits >> 8) as u8);
        }
        if prefix & (1 << 3) != 0 {
            dst.put_u8((self.ack_bits >> 16) as u8);
        }
        if prefix & (1 << 4) != 0 {
            dst.put_u8((self.ack_bits >> 24) as u8);
        }

        let len = total - dst.len();
        debug_assert!(len <= MAX_PACKET_HEADER_BYTES);
        len
    }

    /// Decodes a header from the front of `data`, returning it and its
    /// encoded length.
    ///
    /// Ack-bits bytes omitted on the wire are reconstructed as `0xFF`.
    ///
    /// # Errors
    ///
    /// - [`HeaderError::TooShort`] if `data` cannot hold the header.
    /// - [`HeaderError::BadPrefix`] if byte 0 does not indicate a regular
    ///   packet.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < MIN_PACKET_HEADER_BYTES {
            return Err(HeaderError::TooShort);
        }

        let total = data.len();
        let mut src = data;

        let prefix = src.get_u8();
        if prefix & 1 != 0 {
            return Err(HeaderError::BadPrefix);
        }

        let sequence = src.get_u16_le();

        let ack = if prefix & (1 << 5) != 0 {
            let sequence_difference = src.get_u8();
            sequence.wrapping_sub(u16::from(sequence_difference))
        } else {
            if data.len() < 3 + 2 {
                return Err(HeaderError::TooShort);
            }
            src.get_u16_le()
        };

        let expected_bytes = (1..=4).filter(|i| prefix & (1 << i) != 0).count();
        if src.len() < expected_bytes {
            return Err(HeaderError::TooShort);
        }

        let mut ack_bits = u32::MAX;
        if prefix & (1 << 1) != 0 {
            ack_bits &= 0xFFFF_FF00;
            ack_bits |= u32::from(src.get_u8());
        }
        if prefix & (1 << 2) != 0 {
            ack_bits &= 0xFFFF_00FF;
            ack_bits |= u32::from(src.get_u8()) << 8;
        }
        if prefix & (1 << 3) != 0 {
            ack_bits &= 0xFF00_FFFF;
            ack_bits |= u32::from(src.get_u8()) << 16;
        }
        if prefix & (1 << 4) != 0 {
            ack_bits &= 0x00FF_FFFF;
            ack_bits |= u32::from(src.get_u8()) << 24;
        }

        Ok((
            Self {
                sequence,
                ack,
                ack_bits,
            },
            total - src.len(),
        ))
    }
}

/// Header of one fragment of a fragmented packet.
///
/// Always [`FRAGMENT_HEADER_BYTES`] on the wire:
/// `[prefix = 1, sequence lo, sequence hi, fragment id, fragment count - 1]`.
/// Fragment 0 is additionally followed by the regular [`PacketHeader`] of
/// the packet being reassembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Sequence number of the packet this fragment is a part of.
    pub sequence: u16,
    /// Index of this fragment, in `[0, num_fragments)`.
    pub fragment_id: u8,
    /// How many fragments the packet is split into.
    pub num_fragments: u8,
}

impl FragmentHeader {
    /// Encodes this header into the front of `buf` and returns
    /// [`FRAGMENT_HEADER_BYTES`].
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`FRAGMENT_HEADER_BYTES`], or if
    /// `num_fragments` is 0.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= FRAGMENT_HEADER_BYTES);
        assert!(self.num_fragments > 0);
        let mut dst = buf;
        dst.put_u8(1);
        dst.put_u16_le(self.sequence);
        dst.put_u8(self.fragment_id);
        dst.put_u8(self.num_fragments - 1);
        FRAGMENT_HEADER_BYTES
    }
}

/// Fully decoded and validated fragment datagram header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentInfo {
    /// The fragment header itself.
    pub header: FragmentHeader,
    /// Total header bytes at the front of the datagram, including the
    /// embedded packet header on fragment 0.
    pub header_bytes: usize,
    /// Bytes of fragment payload following the headers.
    pub fragment_bytes: usize,
    /// Ack of the embedded packet header; 0 unless fragment 0.
    pub ack: u16,
    /// Ack bits of the embedded packet header; 0 unless fragment 0.
    pub ack_bits: u32,
}

/// Decodes and validates a fragment datagram against the configured
/// `max_fragments` and `fragment_size`.
///
/// On fragment 0 the embedded packet header is decoded too, and its
/// sequence must equal the fragment's sequence.
///
/// # Errors
///
/// See [`HeaderError`]; any structurally impossible combination is
/// rejected.
pub fn read_fragment_header(
    data: &[u8],
    max_fragments: usize,
    fragment_size: usize,
) -> Result<FragmentInfo, HeaderError> {
    if data.len() < FRAGMENT_HEADER_BYTES {
        return Err(HeaderError::TooShort);
    }

    let mut src = data;
    let prefix = src.get_u8();
    if prefix != 1 {
        return Err(HeaderError::BadPrefix);
    }

    let sequence = src.get_u16_le();
    let fragment_id = usize::from(src.get_u8());
    let num_fragments = usize::from(src.get_u8()) + 1;

    if num_fragments > max_fragments {
        return Err(HeaderError::TooManyFragments {
            num_fragments,
            max: max_fragments,
        });
    }
    if fragment_id >= num_fragments {
        return Err(HeaderError::FragmentIdOutOfRange {
            fragment_id,
            num_fragments,
        });
    }

    let mut header_bytes = FRAGMENT_HEADER_BYTES;
    let mut fragment_bytes = data.len() - FRAGMENT_HEADER_BYTES;
    let mut ack = 0;
    let mut ack_bits = 0;

    if fragment_id == 0 {
        let (packet_header, packet_header_bytes) =
            PacketHeader::decode(&data[FRAGMENT_HEADER_BYTES..])?;
        if packet_header.sequence != sequence {
            return Err(HeaderError::SequenceMismatch {
                embedded: packet_header.sequence,
                sequence,
            });
        }
        ack = packet_header.ack;
        ack_bits = packet_header.ack_bits;
        header_bytes += packet_header_bytes;
        fragment_bytes -= packet_header_bytes;
    }

    if fragment_bytes > fragment_size {
        return Err(HeaderError::FragmentTooLarge {
            len: fragment_bytes,
            max: fragment_size,
        });
    }
    if fragment_id != num_fragments - 1 && fragment_bytes != fragment_size {
        return Err(HeaderError::BadFragmentLen {
            len: fragment_bytes,
            expected: fragment_size,
        });
    }

    Ok(FragmentInfo {
        header: FragmentHeader {
            sequence,
            fragment_id: fragment_id as u8,
            num_fragments: num_fragments as u8,
        },
        header_bytes,
        fragment_bytes,
        ack,
        ack_bits,
    })
}
