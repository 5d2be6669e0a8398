//! Primitive encoders and a bounds-checked reader for MQTT frames.
//!
//! Everything here is byte-exact: the encoders never pad, never reorder and
//! always emit the minimal variable byte integer form.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, WireError};
use bytes::{BufMut, BytesMut};

/// Largest value a variable byte integer can carry.
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

/// Appends `value` as an MQTT variable byte integer.
pub fn encode_variable_int(buf: &mut BytesMut, value: u32) -> Result<()> {
    if value > VARIABLE_INT_MAX {
        return Err(WireError::RemainingLengthTooLarge(value as usize));
    }
    let mut remaining = value;
    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            break;
        }
    }
    Ok(())
}

/// Number of bytes [`encode_variable_int`] emits for `value`.
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Decodes a variable byte integer from the start of `data`.
///
/// Returns `(value, bytes_consumed)`, or `Ok(None)` when `data` ends before
/// the integer does.
pub fn decode_variable_int(data: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for (idx, &byte) in data.iter().enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
        if idx == 3 {
            return Err(WireError::MalformedVariableInt);
        }
    }
    Ok(None)
}

/// Appends a two-byte length prefixed UTF-8 string.
pub fn put_mqtt_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_binary(buf, s.as_bytes())
}

/// Appends two-byte length prefixed binary data.
pub fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::StringTooLong(data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Prefixes `body` with a fixed header carrying `first_byte` and the
/// remaining length.
pub fn wrap_fixed_header(first_byte: u8, body: &[u8]) -> Result<Vec<u8>> {
    let remaining = u32::try_from(body.len())
        .map_err(|_| WireError::RemainingLengthTooLarge(body.len()))?;
    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(first_byte);
    encode_variable_int(&mut packet, remaining)?;
    packet.put_slice(body);
    Ok(packet.to_vec())
}

/// Total length of the first complete frame in `buf`.
///
/// Returns `Ok(None)` while the fixed header or the body is still
/// incomplete.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let Some(rest) = buf.get(1..) else {
        return Ok(None);
    };
    let Some((remaining, header_len)) = decode_variable_int(rest)? else {
        return Ok(None);
    };
    let total = 1 + header_len + remaining as usize;
    if buf.len() >= total {
        Ok(Some(total))
    } else {
        Ok(None)
    }
}

/// Bounds-checked cursor over a frame body.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or(WireError::Truncated {
            needed: len,
            available: self.remaining(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    /// Consumes everything left in the body.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_variable_int(&mut self) -> Result<u32> {
        let rest = &self.data[self.pos..];
        match decode_variable_int(rest)? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(WireError::Truncated {
                needed: rest.len() + 1,
                available: rest.len(),
            }),
        }
    }
}

/// Splits a complete frame into `(first_byte, body)`.
///
/// The body is exactly the remaining length; trailing bytes are ignored.
pub fn split_frame(data: &[u8]) -> Result<(u8, &[u8])> {
    let first = *data.first().ok_or(WireError::Truncated {
        needed: 2,
        available: 0,
    })?;
    let rest = &data[1..];
    let (remaining, header_len) = decode_variable_int(rest)?.ok_or(WireError::Truncated {
        needed: 2,
        available: data.len(),
    })?;
    let end = header_len + remaining as usize;
    let body = rest.get(header_len..end).ok_or(WireError::Truncated {
        needed: 1 + end,
        available: data.len(),
    })?;
    Ok((first, body))
}
