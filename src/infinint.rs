//! Variable-length unsigned integer wire encoding.
//!
//! Counts, sizes and offsets are serialized as a base-256 magnitude preceded
//! by a unary byte-length prefix: `L - 1` zero bits then a one bit, packed
//! MSB-first into whole bytes, followed by exactly `L` big-endian bytes. The
//! scheme carries arbitrary magnitude; this build backs values with `u64` and
//! rejects anything wider when reading.
//!
//! Strings are serialized as a length followed by raw UTF-8 bytes, no
//! terminator.

use crate::error::{Error, Result};
use crate::layer::Layer;

/// Number of payload bytes needed for a value, minimum 1.
fn byte_width(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Serializes a value.
pub fn dump_u64(f: &mut dyn Layer, v: u64) -> Result<()> {
    let width = byte_width(v);
    // width <= 8, so the unary prefix always fits one byte
    let prefix = [0x80u8 >> (width - 1)];
    f.write_all(&prefix)?;
    let be = v.to_be_bytes();
    f.write_all(&be[8 - width..])
}

/// Deserializes a value written by [`dump_u64`].
pub fn read_u64(f: &mut dyn Layer) -> Result<u64> {
    let mut zero_bytes = 0u64;
    let mut byte = [0u8; 1];
    loop {
        f.read_exact(&mut byte)?;
        if byte[0] != 0 {
            break;
        }
        zero_bytes += 1;
        if zero_bytes > 1 {
            // a two-byte prefix already means a 9+ byte magnitude
            return Err(Error::Limit("integer field too wide".into()));
        }
    }
    let bit = byte[0].leading_zeros() as u64;
    if byte[0] != 0x80 >> bit {
        return Err(Error::Data("malformed integer length prefix".into()));
    }
    let width = zero_bytes * 8 + bit + 1;
    if width > 8 {
        return Err(Error::Limit("integer field too wide".into()));
    }
    let mut be = [0u8; 8];
    f.read_exact(&mut be[8 - width as usize..])?;
    Ok(u64::from_be_bytes(be))
}

/// Serializes a signed value (sign byte then magnitude); used for timestamps.
pub fn dump_i64(f: &mut dyn Layer, v: i64) -> Result<()> {
    let sign = [if v < 0 { b'-' } else { b'+' }];
    f.write_all(&sign)?;
    dump_u64(f, v.unsigned_abs())
}

/// Deserializes a value written by [`dump_i64`].
pub fn read_i64(f: &mut dyn Layer) -> Result<i64> {
    let mut sign = [0u8; 1];
    f.read_exact(&mut sign)?;
    let mag = read_u64(f)?;
    match sign[0] {
        b'+' => i64::try_from(mag).map_err(|_| Error::Limit("timestamp overflow".into())),
        b'-' => {
            if mag > i64::MAX as u64 + 1 {
                Err(Error::Limit("timestamp overflow".into()))
            } else {
                Ok((mag as i64).wrapping_neg())
            }
        }
        _ => Err(Error::Data("malformed sign byte".into())),
    }
}

/// Serializes a length-prefixed UTF-8 string.
pub fn dump_string(f: &mut dyn Layer, s: &str) -> Result<()> {
    dump_u64(f, s.len() as u64)?;
    f.write_all(s.as_bytes())
}

/// Deserializes a string written by [`dump_string`].
pub fn read_string(f: &mut dyn Layer) -> Result<String> {
    let bytes = read_byte_block(f)?;
    String::from_utf8(bytes).map_err(|_| Error::Data("string field is not UTF-8".into()))
}

/// Serializes a length-prefixed byte block.
pub fn dump_byte_block(f: &mut dyn Layer, b: &[u8]) -> Result<()> {
    dump_u64(f, b.len() as u64)?;
    f.write_all(b)
}

/// Deserializes a block written by [`dump_byte_block`].
pub fn read_byte_block(f: &mut dyn Layer) -> Result<Vec<u8>> {
    let len = read_u64(f)?;
    if len > u32::MAX as u64 {
        return Err(Error::Data("unreasonable field length".into()));
    }
    let mut buf = vec![0u8; len as usize];
    f.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    fn round_trip(v: u64) -> Vec<u8> {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        dump_u64(&mut m, v).unwrap();
        m.skip(0).unwrap();
        assert_eq!(read_u64(&mut m).unwrap(), v);
        m.into_vec()
    }

    #[test]
    fn u64_round_trip() {
        for v in [0, 1, 127, 128, 255, 256, 65535, 65536, u32::MAX as u64, u64::MAX] {
            round_trip(v);
        }
    }

    #[test]
    fn known_encodings() {
        assert_eq!(round_trip(0), vec![0x80, 0x00]);
        assert_eq!(round_trip(5), vec![0x80, 0x05]);
        assert_eq!(round_trip(256), vec![0x40, 0x01, 0x00]);
        assert_eq!(
            round_trip(u64::MAX),
            vec![0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn rejects_trailing_bits_in_prefix() {
        let mut m = MemoryLayer::from_vec(vec![0xc0, 0x01, 0x02]);
        assert!(matches!(read_u64(&mut m), Err(Error::Data(_))));
    }

    #[test]
    fn rejects_too_wide() {
        // 9-byte magnitude: one zero byte then 0x80 prefix
        let mut data = vec![0x00, 0x80];
        data.extend_from_slice(&[0xff; 9]);
        let mut m = MemoryLayer::from_vec(data);
        assert!(matches!(read_u64(&mut m), Err(Error::Limit(_))));
    }

    #[test]
    fn i64_round_trip() {
        for v in [0i64, 1, -1, i64::MAX, i64::MIN, 1_600_000_000] {
            let mut m = MemoryLayer::new(Mode::ReadWrite);
            dump_i64(&mut m, v).unwrap();
            m.skip(0).unwrap();
            assert_eq!(read_i64(&mut m).unwrap(), v);
        }
    }

    #[test]
    fn string_round_trip() {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        dump_string(&mut m, "héllo").unwrap();
        dump_string(&mut m, "").unwrap();
        m.skip(0).unwrap();
        assert_eq!(read_string(&mut m).unwrap(), "héllo");
        assert_eq!(read_string(&mut m).unwrap(), "");
    }
}
