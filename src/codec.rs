//! Little-endian pack/unpack primitives for NV payloads.
//!
//! This module is intentionally tiny and *boring*: fixed-width integers in
//! and out of byte buffers, fixed-size NUL-padded strings, and the one
//! display heuristic the decoder uses for schema-less `uint8` runs.
//!
//! Arithmetic is done in `i128` so every range check, including the 64-bit
//! extremes, is exact rather than relying on wrapping behaviour.

use crate::err::Diagnostic;

/// A schema-less byte run as seen by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedBytes {
    Ascii(String),
    Bytes(Vec<u8>),
}

/// Packs `value` as an unsigned little-endian integer of `bits` width.
///
/// `bits` must be one of 8/16/32/64; the caller derives it from a primitive
/// type tag so other widths are unreachable.
pub fn pack_uint(bits: u8, value: i128) -> Result<Vec<u8>, Diagnostic> {
    debug_assert!(matches!(bits, 8 | 16 | 32 | 64));
    let max = (1_i128 << bits) - 1;
    if value < 0 || value > max {
        return Err(Diagnostic::OutOfRange {
            bits,
            value,
            signed: false,
        });
    }
    Ok(value.to_le_bytes()[..usize::from(bits / 8)].to_vec())
}

/// Packs `value` as a two's-complement little-endian integer of `bits` width.
pub fn pack_int(bits: u8, value: i128) -> Result<Vec<u8>, Diagnostic> {
    debug_assert!(matches!(bits, 8 | 16 | 32 | 64));
    let min = -(1_i128 << (bits - 1));
    let max = (1_i128 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(Diagnostic::OutOfRange {
            bits,
            value,
            signed: true,
        });
    }
    Ok(value.to_le_bytes()[..usize::from(bits / 8)].to_vec())
}

/// Bytes of `s`, right-padded with NULs to `size`, or truncated to `size`.
pub fn pack_string_fixed(s: &str, size: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(size, 0);
    out
}

/// Consumes `size` bytes, returning the remainder and the little-endian
/// unsigned value.
pub fn unpack_uint(buf: &[u8], size: usize) -> Result<(&[u8], u64), Diagnostic> {
    debug_assert!(matches!(size, 1 | 2 | 4 | 8));
    if buf.len() < size {
        return Err(Diagnostic::Truncated {
            t: "unsigned integer",
            need: size,
            have: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(size);
    let mut value = 0_u64;
    for (i, b) in head.iter().enumerate() {
        value |= u64::from(*b) << (8 * i);
    }
    Ok((rest, value))
}

/// Consumes `size` bytes, returning the remainder and the sign-extended
/// little-endian value.
pub fn unpack_int(buf: &[u8], size: usize) -> Result<(&[u8], i64), Diagnostic> {
    let (rest, raw) = unpack_uint(buf, size).map_err(|e| match e {
        Diagnostic::Truncated { need, have, .. } => Diagnostic::Truncated {
            t: "signed integer",
            need,
            have,
        },
        other => other,
    })?;
    let shift = 64 - (size as u32 * 8);
    Ok((rest, ((raw << shift) as i64) >> shift))
}

/// Consumes `size` bytes, strips trailing NULs, and returns the remainder
/// plus the text (lossy where not UTF-8).
pub fn unpack_cstr(buf: &[u8], size: usize) -> Result<(&[u8], String), Diagnostic> {
    if buf.len() < size {
        return Err(Diagnostic::Truncated {
            t: "fixed-size string",
            need: size,
            have: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(size);
    let end = head
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    Ok((rest, String::from_utf8_lossy(&head[..end]).into_owned()))
}

/// Decoder heuristic for `uint8` runs with no better shape information:
/// more than two bytes, all printable ASCII, reads as one string. This only
/// affects how dumps render, never the bytes themselves.
pub fn uint8_or_ascii(buf: &[u8]) -> DecodedBytes {
    if buf.len() > 2 && buf.iter().all(|b| (32..=127).contains(b)) {
        DecodedBytes::Ascii(String::from_utf8_lossy(buf).into_owned())
    } else {
        DecodedBytes::Bytes(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_little_endian() {
        assert_eq!(pack_uint(16, 0x0417).unwrap(), vec![0x17, 0x04]);
        assert_eq!(pack_uint(32, 132183).unwrap(), vec![0x57, 0x04, 0x02, 0x00]);
        assert_eq!(pack_int(32, -1).unwrap(), vec![0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn unsigned_range_boundaries() {
        assert_eq!(pack_uint(16, 65535).unwrap(), vec![0xff, 0xff]);
        assert!(matches!(
            pack_uint(16, 65536),
            Err(Diagnostic::OutOfRange { bits: 16, .. })
        ));
        assert!(matches!(
            pack_uint(8, -1),
            Err(Diagnostic::OutOfRange { bits: 8, .. })
        ));
    }

    #[test]
    fn signed_range_boundaries() {
        assert_eq!(pack_int(16, -32768).unwrap(), vec![0x00, 0x80]);
        assert!(matches!(
            pack_int(16, -32769),
            Err(Diagnostic::OutOfRange { bits: 16, .. })
        ));
    }

    #[test]
    fn sixty_four_bit_extremes_are_exact() {
        assert_eq!(pack_uint(64, u64::MAX as i128).unwrap().len(), 8);
        assert!(pack_uint(64, 1 + u64::MAX as i128).is_err());
        assert_eq!(pack_int(64, i64::MIN as i128).unwrap().len(), 8);
        assert!(pack_int(64, i64::MIN as i128 - 1).is_err());
        assert!(pack_int(64, i64::MAX as i128 + 1).is_err());
    }

    #[test]
    fn pack_unpack_round_trip() {
        for bits in [8_u8, 16, 32, 64] {
            for value in [0_i128, 1, 0x7f, (1 << bits) - 1] {
                let packed = pack_uint(bits, value).unwrap();
                let (rest, got) = unpack_uint(&packed, usize::from(bits / 8)).unwrap();
                assert!(rest.is_empty());
                assert_eq!(got as i128, value);
            }
            for value in [-1_i128, -(1 << (bits - 1)), (1 << (bits - 1)) - 1] {
                let packed = pack_int(bits, value).unwrap();
                let (rest, got) = unpack_int(&packed, usize::from(bits / 8)).unwrap();
                assert!(rest.is_empty());
                assert_eq!(i128::from(got), value);
            }
        }
    }

    #[test]
    fn unpack_reports_truncation() {
        assert!(matches!(
            unpack_uint(&[0x01], 2),
            Err(Diagnostic::Truncated { need: 2, have: 1, .. })
        ));
    }

    #[test]
    fn fixed_strings_pad_and_truncate() {
        assert_eq!(pack_string_fixed("ims", 5), b"ims\x00\x00");
        assert_eq!(pack_string_fixed("overflow", 4), b"over");
        let (rest, s) = unpack_cstr(b"ims\x00\x00rest", 5).unwrap();
        assert_eq!(s, "ims");
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn ascii_heuristic() {
        assert_eq!(
            uint8_or_ascii(b"ims"),
            DecodedBytes::Ascii("ims".to_owned())
        );
        // Two bytes stay bytes even when printable.
        assert_eq!(uint8_or_ascii(b"ok"), DecodedBytes::Bytes(vec![0x6f, 0x6b]));
        assert_eq!(
            uint8_or_ascii(&[0x01, 0x02, 0x03]),
            DecodedBytes::Bytes(vec![0x01, 0x02, 0x03])
        );
    }
}
