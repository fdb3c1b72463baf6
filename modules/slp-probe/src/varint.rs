//! Minecraft protocol VarInt codec: 7 data bits per byte, high bit set on
//! continuation, at most 5 bytes.

use thiserror::Error;

/// Maximum number of bytes a VarInt occupies on the wire.
pub const MAX_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarIntError {
    #[error("incomplete VarInt")]
    Incomplete,
    #[error("VarInt is too large")]
    TooLarge,
}

/// Append `value` to `buf`, low 7-bit group first.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

/// Decode a VarInt from the front of `r`, advancing past the bytes read.
pub fn read_varint(r: &mut &[u8]) -> Result<i32, VarIntError> {
    let mut val = 0i32;
    for i in 0..MAX_SIZE {
        let byte = match r.first() {
            Some(&b) => b,
            None => return Err(VarIntError::Incomplete),
        };
        *r = &r[1..];
        val |= ((byte & 0x7f) as i32) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(val);
        }
    }
    Err(VarIntError::TooLarge)
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    #[test]
    fn round_trip() {
        let mut rng = thread_rng();
        let mut buf = Vec::new();
        for n in (0..100_000)
            .map(|_| rng.gen_range(0..i32::MAX))
            .chain([0, 1, 127, 128, 16383, 16384, i32::MAX - 1, i32::MAX])
        {
            buf.clear();
            write_varint(&mut buf, n);
            assert!(buf.len() <= MAX_SIZE);

            let mut slice = buf.as_slice();
            assert_eq!(read_varint(&mut slice), Ok(n));
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn known_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        assert_eq!(buf, [0x00]);
        buf.clear();
        write_varint(&mut buf, 127);
        assert_eq!(buf, [0x7f]);
        buf.clear();
        write_varint(&mut buf, 128);
        assert_eq!(buf, [0x80, 0x01]);
        buf.clear();
        write_varint(&mut buf, 25565);
        assert_eq!(buf, [0xdd, 0xc7, 0x01]);
    }

    #[test]
    fn overflow_past_five_bytes_is_an_error() {
        let mut slice: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(read_varint(&mut slice), Err(VarIntError::TooLarge));
    }

    #[test]
    fn truncated_input_is_incomplete() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert_eq!(read_varint(&mut slice), Err(VarIntError::Incomplete));
    }
}
