//! Variable-length primitives of MQTT 3.1.1
//!
//! Length-prefixed UTF-8 strings and the 1-4 byte "remaining length" integer.
//! Encoding is checked: oversized values are rejected, never truncated.

use super::error::{DecodeError, EncodeError};

/// Largest string payload a 2-byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Largest value a 4-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Appends `s` with its 2-byte big-endian length prefix.
pub fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    write_bytes(buf, s.as_bytes())
}

/// Appends raw bytes with a 2-byte big-endian length prefix.
pub fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong { len: data.len() });
    }
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

pub fn encode_string(s: &str) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(2 + s.len());
    write_string(&mut buf, s)?;
    Ok(buf)
}

/// Reads a length-prefixed string, returning it with the number of bytes consumed.
pub fn decode_string(data: &[u8]) -> Result<(String, usize), DecodeError> {
    let len_bytes = data.get(0..2).ok_or(DecodeError::Incomplete)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let raw = data.get(2..2 + len).ok_or(DecodeError::Incomplete)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((s.to_string(), 2 + len))
}

/// Appends the remaining-length varint, returning how many bytes were written.
pub fn write_remaining_length(buf: &mut Vec<u8>, mut len: usize) -> Result<usize, EncodeError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(EncodeError::RemainingLengthTooLarge(len));
    }
    let mut written = 0;
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        written += 1;
        if len == 0 {
            return Ok(written);
        }
    }
}

pub fn encode_remaining_length(len: usize) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(4);
    write_remaining_length(&mut buf, len)?;
    Ok(buf)
}

/// Reads a remaining-length varint, returning `(value, bytes_consumed)`.
///
/// A continuation bit on the fourth byte is malformed; running out of input
/// before the last byte is `Incomplete`.
pub fn decode_remaining_length(data: &[u8]) -> Result<(usize, usize), DecodeError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in data.iter().enumerate() {
        if i >= 4 {
            return Err(DecodeError::MalformedRemainingLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }

    if data.len() >= 4 {
        Err(DecodeError::MalformedRemainingLength)
    } else {
        Err(DecodeError::Incomplete)
    }
}
