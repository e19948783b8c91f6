//! Byte-mutation generators (`spec.md` §4.H).
//!
//! Every generator here produces byte-aligned output only; a non-byte-aligned
//! atom makes `less`/`more`/`enumerated` return `None`, which the fuzzer turns
//! into a skipped-with-warning entry rather than a hard error.

use crate::value::{decode, encode_bytes, AtomBaseType, Endianness, Scalar};
use rand::Rng;

fn endianness(big_endian: bool) -> Endianness {
    if big_endian {
        Endianness::Big
    } else {
        Endianness::Little
    }
}

/// Reassembles bytes in the MSB-first order `BitReader::read_bits` would have
/// produced them in, i.e. the same "raw" convention [`crate::value::decode`]
/// expects before it applies any endianness swap.
fn bytes_to_raw(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

pub fn zero(byte_count: usize) -> Vec<u8> {
    vec![0u8; byte_count]
}

pub fn ones(byte_count: usize) -> Vec<u8> {
    vec![0xFFu8; byte_count]
}

pub fn rand(byte_count: usize, rng: &mut impl Rng) -> Vec<u8> {
    (0..byte_count).map(|_| rng.gen()).collect()
}

fn nudge(
    raw_bytes: &[u8],
    bit_count: u32,
    base_type: AtomBaseType,
    big_endian: bool,
    delta: i64,
) -> Option<Vec<u8>> {
    if bit_count == 0 || bit_count % 8 != 0 {
        return None;
    }
    let endian = endianness(big_endian);
    let raw = bytes_to_raw(raw_bytes);
    let scalar = decode(raw, bit_count, base_type, endian).ok()?;
    let nudged = match scalar {
        Scalar::Signed(v) => Scalar::Signed(v.wrapping_add(delta)),
        Scalar::Unsigned(v) => Scalar::Unsigned(v.wrapping_add(delta as u64)),
        Scalar::Float(v) => Scalar::Float(v + delta as f64),
    };
    Some(encode_bytes(nudged, bit_count, endian))
}

/// Decodes the current bytes, subtracts one, re-encodes.
pub fn less(raw_bytes: &[u8], bit_count: u32, base_type: AtomBaseType, big_endian: bool) -> Option<Vec<u8>> {
    nudge(raw_bytes, bit_count, base_type, big_endian, -1)
}

/// Decodes the current bytes, adds one, re-encodes.
pub fn more(raw_bytes: &[u8], bit_count: u32, base_type: AtomBaseType, big_endian: bool) -> Option<Vec<u8>> {
    nudge(raw_bytes, bit_count, base_type, big_endian, 1)
}

/// Encodes a specific scalar value (used for enumerated-option derivatives).
pub fn enumerated(value: f64, base_type: AtomBaseType, big_endian: bool, bit_count: u32) -> Option<Vec<u8>> {
    if bit_count == 0 || bit_count % 8 != 0 {
        return None;
    }
    let scalar = match base_type {
        AtomBaseType::Float => Scalar::Float(value),
        AtomBaseType::Signed => Scalar::Signed(value as i64),
        AtomBaseType::Unsigned | AtomBaseType::Bool => Scalar::Unsigned(value as u64),
    };
    Some(encode_bytes(scalar, bit_count, endianness(big_endian)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_ones_fill_the_whole_width() {
        assert_eq!(zero(3), vec![0, 0, 0]);
        assert_eq!(ones(3), vec![0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn less_decrements_unsigned_big_endian() {
        let bytes = 10u16.to_be_bytes();
        let out = less(&bytes, 16, AtomBaseType::Unsigned, true).unwrap();
        assert_eq!(u16::from_be_bytes([out[0], out[1]]), 9);
    }

    #[test]
    fn more_increments_signed_little_endian() {
        let bytes = (-5i16).to_le_bytes();
        let out = more(&bytes, 16, AtomBaseType::Signed, false).unwrap();
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), -4);
    }

    #[test]
    fn non_byte_aligned_width_is_refused() {
        assert!(less(&[0], 3, AtomBaseType::Unsigned, true).is_none());
    }

    #[test]
    fn enumerated_encodes_requested_value() {
        let out = enumerated(300.0, AtomBaseType::Unsigned, true, 16).unwrap();
        assert_eq!(u16::from_be_bytes([out[0], out[1]]), 300);
    }
}
