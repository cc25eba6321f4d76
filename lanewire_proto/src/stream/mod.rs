//! Typed serialisation layer over the bit codec: ranged integers, byte
//! blobs, alignment, and relative-sequence encoding.
//!
//! [`WriteStream`] and [`ReadStream`] mirror each other; a packet is
//! readable iff the reads happen in exactly the order of the writes. Write
//! operations are infallible (capacity is the caller's responsibility,
//! checked with `debug_assert!`); read operations return a [`Result`] and
//! fail cleanly on truncated or corrupted input.

mod read;
mod write;

pub use {read::*, write::*};

use crate::bits::bits_required;

/// Error of a [`ReadStream`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Reading would go past the end of the buffer.
    #[error("stream too short")]
    TooShort,
    /// Byte-boundary padding bits were non-zero.
    ///
    /// The writer only ever pads with zeros, so this indicates frame-level
    /// corruption.
    #[error("non-zero padding bits")]
    BadPadding,
    /// A ranged integer decoded outside its declared range.
    #[error("value out of range")]
    OutOfRange,
}

/// Number of bits the relative-sequence encoding of `second` against
/// `first` takes on the wire.
///
/// Tiered: small deltas use a short run of flag bits plus a narrow ranged
/// integer, large deltas fall back to the full 32-bit representation. The
/// exact tiers are part of the wire protocol:
///
/// | delta          | bits on the wire |
/// |----------------|------------------|
/// | 1              | 1                |
/// | 2..=5          | 2 + 2            |
/// | 6..=21         | 3 + 4            |
/// | 22..=277       | 4 + 8            |
/// | 278..=4373     | 5 + 12           |
/// | 4374..=69909   | 6 + 16           |
/// | otherwise      | 32               |
#[must_use]
pub const fn relative_sequence_bits(first: u16, second: u16) -> u32 {
    const WRAP: u32 = u16::MAX as u32 + 1;
    let a = first as u32;
    let b = second as u32 + if first >= second { WRAP } else { 0 };
    let difference = b - a;

    if difference == 1 {
        1
    } else if difference < 6 {
        2 + bits_required(2, 5)
    } else if difference < 22 {
        3 + bits_required(6, 21)
    } else if difference < 278 {
        4 + bits_required(22, 277)
    } else if difference < 4374 {
        5 + bits_required(278, 4373)
    } else if difference < 69910 {
        6 + bits_required(4374, 69909)
    } else {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_relative(prev: u16, cur: u16) -> (u16, u32) {
        let mut writer = WriteStream::new(16);
        writer.write_sequence_relative(prev, cur);
        let bits = writer.bits_processed();
        writer.flush();
        let buf = writer.as_bytes().to_vec();

        let mut reader = ReadStream::new(&buf);
        let got = reader.read_sequence_relative(prev).unwrap();
        assert_eq!(reader.bits_processed(), bits);
        (got, bits)
    }

    #[test]
    fn relative_sequence_tier_sizes() {
        // the tier table is part of the wire protocol
        for (prev, cur, expect_bits) in [
            (1000u16, 1001u16, 1),
            (1000, 1005, 4),
            (1000, 1020, 7),
            (1000, 1277, 12),
            (1000, 1278, 17),
            (1000, 5373, 17),
            (1000, 5374, 22),
            (0, 0, 22),     // wrapped delta of 65536
            (65535, 0, 1),  // wrap by one
            (65535, 4, 4),  // wrap into the second tier
        ] {
            let (got, bits) = roundtrip_relative(prev, cur);
            assert_eq!(got, cur, "prev = {prev}, cur = {cur}");
            assert_eq!(bits, expect_bits, "prev = {prev}, cur = {cur}");
            assert_eq!(
                bits,
                relative_sequence_bits(prev, cur),
                "prev = {prev}, cur = {cur}"
            );
        }
    }

    #[test]
    fn relative_sequence_exhaustive_deltas() {
        // invariant: roundtrip yields prev + delta mod 2^16 for every tier
        for delta in (1u32..=300).chain([4373, 4374, 65535, 65536]) {
            let prev = 60000u16;
            let cur = (u32::from(prev) + delta) as u16;
            let (got, bits) = roundtrip_relative(prev, cur);
            assert_eq!(got, cur, "delta = {delta}");
            assert_eq!(bits, relative_sequence_bits(prev, cur), "delta = {delta}");
        }
    }

    #[test]
    fn ranged_integer_widths() {
        let mut writer = WriteStream::new(16);
        writer.write_int(3, 0, 7);
        assert_eq!(writer.bits_processed(), 3);
        writer.write_int(200, 22, 277);
        assert_eq!(writer.bits_processed(), 3 + 8);
        writer.flush();

        let mut reader = ReadStream::new(writer.as_bytes());
        assert_eq!(reader.read_int(0, 7).unwrap(), 3);
        assert_eq!(reader.read_int(22, 277).unwrap(), 200);
    }

    #[test]
    fn ranged_integer_minimum_maps_to_zero_bits_value() {
        let mut writer = WriteStream::new(4);
        writer.write_int(22, 22, 277);
        writer.flush();
        let mut reader = ReadStream::new(writer.as_bytes());
        assert_eq!(reader.read_int(22, 277).unwrap(), 22);
    }

    #[test]
    fn bool_and_bits() {
        let mut writer = WriteStream::new(4);
        writer.write_bool(true);
        writer.write_bool(false);
        writer.write_bits(0b1011, 4);
        writer.flush();

        let mut reader = ReadStream::new(writer.as_bytes());
        assert!(reader.read_bool().unwrap());
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_bits(4).unwrap(), 0b1011);
    }

    #[test]
    fn bytes_align_before_copy() {
        let mut writer = WriteStream::new(32);
        writer.write_bits(1, 1);
        writer.write_bytes(b"abcdef");
        writer.flush();

        let mut reader = ReadStream::new(writer.as_bytes());
        assert_eq!(reader.read_bits(1).unwrap(), 1);
        let mut out = [0u8; 6];
        reader.read_bytes(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn short_read_errors() {
        let mut writer = WriteStream::new(4);
        writer.write_bits(0xAA, 8);
        writer.flush();

        let mut reader = ReadStream::new(writer.as_bytes());
        assert_eq!(reader.read_bits(8).unwrap(), 0xAA);
        assert_eq!(reader.read_bits(1), Err(StreamError::TooShort));
    }

    #[test]
    fn out_of_range_value_rejected() {
        let mut writer = WriteStream::new(4);
        // 3 bits for [0, 5]; raw value 7 decodes above max
        writer.write_bits(7, 3);
        writer.flush();

        let mut reader = ReadStream::new(writer.as_bytes());
        assert_eq!(reader.read_int(0, 5), Err(StreamError::OutOfRange));
    }
}
