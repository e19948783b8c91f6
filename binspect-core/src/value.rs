//! Typed scalar decoding.
//!
//! The bit reader only deals in raw, unsigned bit patterns. This module turns
//! those patterns into the three scalar flavors an atom can declare
//! (`Signed`, `Unsigned`, `Float`), honoring declared endianness and bit
//! width (1..=64, with floats restricted to 32/64). It also runs the reverse
//! direction — encoding a `Scalar` back to bytes — which the fuzzer needs for
//! its `less`/`more` generators (decode, nudge, re-encode).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomBaseType {
    Unsigned,
    Signed,
    Float,
    Bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("float atoms must be 32 or 64 bits wide, got {0}")]
    InvalidFloatWidth(u32),

    #[error("bit count {0} exceeds the 64-bit scalar limit")]
    TooWide(u32),

    #[error("bit count must be nonzero for atom decoding")]
    ZeroWidth,
}

/// A decoded scalar value, still tagged with its source representation.
///
/// The expression VM ([`crate::expr`]) immediately collapses these to `f64`
/// once they enter an expression context, mirroring the original's
/// `convert_raw`, which always returned `static_cast<double>(value)`
/// regardless of the atom's declared type. `Scalar` itself stays exact so the
/// fuzzer's byte-level encoder round-trips without precision loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::Signed(v) => v as f64,
            Scalar::Unsigned(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }

    pub fn base_type(&self) -> AtomBaseType {
        match self {
            Scalar::Signed(_) => AtomBaseType::Signed,
            Scalar::Unsigned(_) => AtomBaseType::Unsigned,
            Scalar::Float(_) => AtomBaseType::Float,
        }
    }
}

/// Reverses the byte order of the low `bit_count / 8` bytes of `raw`, which
/// was assembled MSB-first by the bit reader. Bit counts that aren't a whole
/// number of bytes have no well-defined byte order and are left untouched.
fn swap_bytes_for_width(raw: u64, bit_count: u32) -> u64 {
    let byte_count = (bit_count / 8) as usize;
    if byte_count <= 1 {
        return raw;
    }
    let be = raw.to_be_bytes();
    let mut swapped = [0u8; 8];
    let src = &be[8 - byte_count..];
    for (i, b) in src.iter().enumerate() {
        swapped[8 - byte_count + (byte_count - 1 - i)] = *b;
    }
    u64::from_be_bytes(swapped)
}

fn sign_extend(raw: u64, bit_count: u32) -> i64 {
    if bit_count >= 64 {
        return raw as i64;
    }
    let shift = 64 - bit_count;
    ((raw << shift) as i64) >> shift
}

/// Decodes `bit_count` raw bits (as produced by
/// [`crate::bitreader::BitReader::read_bits`]) into a typed [`Scalar`].
pub fn decode(
    raw: u64,
    bit_count: u32,
    base_type: AtomBaseType,
    endianness: Endianness,
) -> Result<Scalar, ValueError> {
    if bit_count == 0 {
        return Err(ValueError::ZeroWidth);
    }
    if bit_count > 64 {
        return Err(ValueError::TooWide(bit_count));
    }

    let raw = match endianness {
        Endianness::Big => raw,
        Endianness::Little => swap_bytes_for_width(raw, bit_count),
    };

    match base_type {
        AtomBaseType::Unsigned => Ok(Scalar::Unsigned(raw)),
        AtomBaseType::Bool => Ok(Scalar::Unsigned(raw)),
        AtomBaseType::Signed => Ok(Scalar::Signed(sign_extend(raw, bit_count))),
        AtomBaseType::Float => match bit_count {
            32 => Ok(Scalar::Float(f32::from_bits(raw as u32) as f64)),
            64 => Ok(Scalar::Float(f64::from_bits(raw))),
            other => Err(ValueError::InvalidFloatWidth(other)),
        },
    }
}

/// Encodes a scalar back to exactly `bit_count.div_ceil(8)` bytes, honoring
/// endianness. Used only by the fuzzer, which mutates byte-aligned atoms.
pub fn encode_bytes(scalar: Scalar, bit_count: u32, endianness: Endianness) -> Vec<u8> {
    debug_assert!(bit_count % 8 == 0, "fuzz mutation targets are byte-aligned");
    let byte_count = (bit_count / 8) as usize;

    let raw: u64 = match scalar {
        Scalar::Unsigned(v) => v,
        Scalar::Signed(v) => (v as u64) & mask_for(bit_count),
        Scalar::Float(v) => match bit_count {
            32 => (v as f32).to_bits() as u64,
            64 => v.to_bits(),
            _ => v.to_bits(),
        },
    };

    let be = raw.to_be_bytes();
    let mut bytes = be[8 - byte_count..].to_vec();
    if endianness == Endianness::Little {
        bytes.reverse();
    }
    bytes
}

fn mask_for(bit_count: u32) -> u64 {
    if bit_count >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_count) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_unsigned_big_endian() {
        let v = decode(0x1234, 16, AtomBaseType::Unsigned, Endianness::Big).unwrap();
        assert_eq!(v, Scalar::Unsigned(0x1234));
    }

    #[test]
    fn decodes_little_endian_swaps_bytes() {
        let v = decode(0x1234, 16, AtomBaseType::Unsigned, Endianness::Little).unwrap();
        assert_eq!(v, Scalar::Unsigned(0x3412));
    }

    #[test]
    fn sign_extends_negative_values() {
        let v = decode(0xFF, 8, AtomBaseType::Signed, Endianness::Big).unwrap();
        assert_eq!(v, Scalar::Signed(-1));
    }

    #[test]
    fn decodes_32_bit_float() {
        let bits = 1.5f32.to_bits() as u64;
        let v = decode(bits, 32, AtomBaseType::Float, Endianness::Big).unwrap();
        assert_eq!(v, Scalar::Float(1.5));
    }

    #[test]
    fn rejects_odd_float_width() {
        let err = decode(0, 16, AtomBaseType::Float, Endianness::Big).unwrap_err();
        assert_eq!(err, ValueError::InvalidFloatWidth(16));
    }

    #[test]
    fn encode_decode_roundtrip_unsigned() {
        let bytes = encode_bytes(Scalar::Unsigned(0xBEEF), 16, Endianness::Big);
        let raw = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
        let back = decode(raw, 16, AtomBaseType::Unsigned, Endianness::Big).unwrap();
        assert_eq!(back, Scalar::Unsigned(0xBEEF));
    }

    #[test]
    fn encode_little_endian_reverses_bytes() {
        let bytes = encode_bytes(Scalar::Unsigned(0x1234), 16, Endianness::Little);
        assert_eq!(bytes, vec![0x34, 0x12]);
    }

    #[test]
    fn as_f64_unifies_like_the_original_convert_raw() {
        assert_eq!(Scalar::Signed(-2).as_f64(), -2.0);
        assert_eq!(Scalar::Unsigned(7).as_f64(), 7.0);
        assert_eq!(Scalar::Float(2.5).as_f64(), 2.5);
    }
}
