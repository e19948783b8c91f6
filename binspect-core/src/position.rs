//! Bit-addressable file positions.
//!
//! A [`Position`] is a (byte_offset, bit_offset) pair, ordered, with
//! saturating-ish additive arithmetic that carries across the byte boundary.
//! It is the unit of addressing used by the bit reader, the inspection
//! forest (start/end offsets, atom locations) and the expression VM
//! (`startof`/`endof`/`padd`/`psub`/`gtell`).

use std::fmt;

/// A bit offset within a byte, always in `0..8`.
const BITS_PER_BYTE: u64 = 8;

/// A byte-and-bit file position.
///
/// Ordered lexicographically by `(byte_offset, bit_offset)`. [`Position::INVALID`]
/// is a dedicated sentinel (mirroring the original implementation's
/// `invalid_position_k`) used wherever "no position yet" needs to be
/// distinguished from position zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    byte_offset: u64,
    bit_offset: u8,
}

impl Position {
    /// A sentinel for "no position". Never produced by ordinary arithmetic;
    /// comparisons against it are only meaningful via [`Position::is_invalid`].
    pub const INVALID: Position = Position {
        byte_offset: u64::MAX,
        bit_offset: 0,
    };

    /// Constructs a position from a byte count and a bit count, normalizing
    /// any bit overflow (`bits >= 8`) into the byte part.
    pub fn new(bytes: u64, bits: u64) -> Self {
        Position {
            byte_offset: bytes + bits / BITS_PER_BYTE,
            bit_offset: (bits % BITS_PER_BYTE) as u8,
        }
    }

    /// A position at a whole byte offset.
    pub fn from_bytes(bytes: u64) -> Self {
        Position::new(bytes, 0)
    }

    /// A position expressed purely as a bit count from the origin.
    pub fn from_bits(bits: u64) -> Self {
        Position::new(0, bits)
    }

    pub fn is_invalid(&self) -> bool {
        *self == Position::INVALID
    }

    pub fn byte_aligned(&self) -> bool {
        self.bit_offset == 0
    }

    pub fn bytes(&self) -> u64 {
        self.byte_offset
    }

    pub fn bits(&self) -> u8 {
        self.bit_offset
    }

    /// Total number of bits from the origin to this position.
    pub fn total_bits(&self) -> u64 {
        self.byte_offset * BITS_PER_BYTE + self.bit_offset as u64
    }
}

impl std::ops::Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        let mut byte_offset = self.byte_offset + rhs.byte_offset;
        let mut bit_offset = self.bit_offset as u64 + rhs.bit_offset as u64;

        byte_offset += bit_offset / BITS_PER_BYTE;
        bit_offset %= BITS_PER_BYTE;

        Position {
            byte_offset,
            bit_offset: bit_offset as u8,
        }
    }
}

impl std::ops::AddAssign for Position {
    fn add_assign(&mut self, rhs: Position) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        let mut byte_offset = self.byte_offset;
        let mut bit_offset = self.bit_offset;

        if bit_offset < rhs.bit_offset {
            byte_offset = byte_offset.wrapping_sub(1);
            bit_offset += 8;
        }

        Position {
            byte_offset: byte_offset.wrapping_sub(rhs.byte_offset),
            bit_offset: bit_offset - rhs.bit_offset,
        }
    }
}

impl std::ops::SubAssign for Position {
    fn sub_assign(&mut self, rhs: Position) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.byte_offset)?;
        if !self.byte_aligned() {
            write!(f, ".{}", self.bit_offset)?;
        }
        Ok(())
    }
}

/// One whole byte, as a [`Position`] delta. Handy for "inclusive end" math:
/// `end - start + BYTE` is the byte span covered by `[start, end]`.
pub const BYTE: Position = Position {
    byte_offset: 1,
    bit_offset: 0,
};

/// One bit, as a [`Position`] delta.
pub const BIT: Position = Position {
    byte_offset: 0,
    bit_offset: 1,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bit_overflow() {
        let pos = Position::new(0, 10);
        assert_eq!(pos.bytes(), 1);
        assert_eq!(pos.bits(), 2);
    }

    #[test]
    fn add_carries_across_byte_boundary() {
        let a = Position::new(2, 5);
        let b = Position::new(0, 5);
        let sum = a + b;
        assert_eq!(sum.bytes(), 3);
        assert_eq!(sum.bits(), 2);
    }

    #[test]
    fn sub_borrows_across_byte_boundary() {
        let a = Position::new(3, 2);
        let b = Position::new(0, 5);
        let diff = a - b;
        assert_eq!(diff.bytes(), 2);
        assert_eq!(diff.bits(), 5);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Position::new(1, 0) < Position::new(1, 1));
        assert!(Position::new(1, 7) < Position::new(2, 0));
    }

    #[test]
    fn byte_aligned_detection() {
        assert!(Position::new(4, 0).byte_aligned());
        assert!(!Position::new(4, 3).byte_aligned());
    }

    #[test]
    fn display_matches_original_format() {
        assert_eq!(Position::new(4, 0).to_string(), "4");
        assert_eq!(Position::new(4, 3).to_string(), "4.3");
    }

    #[test]
    fn invalid_is_a_dedicated_sentinel() {
        assert!(Position::INVALID.is_invalid());
        assert!(!Position::default().is_invalid());
    }
}
