//! Low level decoding primitives shared by the FST reader.
//!
//! Everything here works on in-memory buffers with an explicit offset so the
//! callers can report exactly where a decode went wrong.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{WaveError, WaveResult};

/// Size of the prefix at the start of every FST block: a type byte followed
/// by a big-endian length.
pub const BLOCK_HEADER_LEN: usize = 9;

/// Decode an unsigned varint starting at `offset`. Returns the value and the
/// offset of the byte after it.
///
/// There is no upper bound on the number of bytes; bits shifted past 64 are
/// dropped, so the caller is responsible for limiting sizes.
pub fn read_var_uint(buffer: &[u8], offset: usize) -> WaveResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut pos = offset;
    while let Some(&byte) = buffer.get(pos) {
        pos += 1;
        if shift < 64 {
            value |= ((byte & 0x7F) as u64) << shift;
        }
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
        shift += 7;
    }
    Err(WaveError::MalformedVarint { offset })
}

/// Decode a signed (sign-extended) varint starting at `offset`.
pub fn read_var_int(buffer: &[u8], offset: usize) -> WaveResult<(i64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut pos = offset;
    while let Some(&byte) = buffer.get(pos) {
        pos += 1;
        if shift < 64 {
            value |= ((byte & 0x7F) as u64) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            // Sign-extend if the top data bit of the last byte is set.
            if byte & 0x40 != 0 && shift < 64 {
                value |= u64::MAX << shift;
            }
            return Ok((value as i64, pos));
        }
    }
    Err(WaveError::MalformedVarint { offset })
}

/// Read a NUL-terminated string. The returned offset is past the terminator.
pub fn read_cstring(buffer: &[u8], offset: usize) -> WaveResult<(String, usize)> {
    let rest = buffer
        .get(offset..)
        .ok_or(WaveError::UnterminatedString { offset })?;
    let len = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or(WaveError::UnterminatedString { offset })?;
    let s = String::from_utf8_lossy(&rest[..len]).into_owned();
    Ok((s, offset + len + 1))
}

/// Read the type byte and length that start every FST block.
///
/// The length is as stored in the file, i.e. it includes its own 8 bytes but
/// not the type byte.
pub fn read_block_header(buffer: &[u8]) -> WaveResult<(u8, u64)> {
    if buffer.len() < BLOCK_HEADER_LEN {
        return Err(WaveError::TruncatedFile {
            offset: 0,
            needed: BLOCK_HEADER_LEN as u64,
            available: buffer.len() as u64,
        });
    }
    Ok((buffer[0], BigEndian::read_u64(&buffer[1..BLOCK_HEADER_LEN])))
}

/// Number of bytes `value` takes when encoded as an unsigned varint.
pub fn varint_length(mut value: u64) -> usize {
    for x in 1..=10 {
        value >>= 7;
        if value == 0 {
            return x;
        }
    }
    unreachable!()
}

/// Encode an unsigned varint. Return the number of bytes written. There must be
/// enough space in the output. The maximum number of bytes written is 10.
pub fn encode_varint(output: &mut [u8], mut value: u64) -> usize {
    const MAX_BYTES: usize = 10;
    for (i, out) in output.iter_mut().enumerate().take(MAX_BYTES) {
        let mut bits = value as u8 & 0x7F;
        value >>= 7;
        let more = value != 0;
        if more {
            bits |= 0x80;
        }
        *out = bits;
        if !more {
            return i + 1;
        }
    }
    MAX_BYTES
}

/// Encode a signed varint. Return the number of bytes written.
pub fn encode_svarint(output: &mut [u8], mut value: i64) -> usize {
    const MAX_BYTES: usize = 10;
    for (i, out) in output.iter_mut().enumerate().take(MAX_BYTES) {
        let mut bits = value as u8 & 0x7F;
        value >>= 7;
        // More if the value has more non-sign bits in it, or the top bit of
        // the current byte doesn't match the sign.
        let more = (value != 0 && value != -1) || ((value as u8) & 0x40) != (bits & 0x40);
        if more {
            bits |= 0x80;
        }
        *out = bits;
        if !more {
            return i + 1;
        }
    }
    MAX_BYTES
}

/// Append an unsigned varint to a byte vector.
pub fn push_varint(output: &mut Vec<u8>, value: u64) {
    let mut buf = [0; 10];
    let n = encode_varint(&mut buf, value);
    output.extend_from_slice(&buf[..n]);
}

/// Append a signed varint to a byte vector.
pub fn push_svarint(output: &mut Vec<u8>, value: i64) {
    let mut buf = [0; 10];
    let n = encode_svarint(&mut buf, value);
    output.extend_from_slice(&buf[..n]);
}
