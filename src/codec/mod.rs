//! MQTT wire codec
//!
//! Three layers:
//! - primitives in this module: remaining length, length-prefixed strings
//!   and binaries, big-endian integers;
//! - [`FrameReader`] pulls one fixed header plus body off an async stream;
//! - [`PacketDecoder`] / [`PacketEncoder`] turn a body into a [`Packet`] and
//!   back, using the protocol version negotiated by CONNECT.
//!
//! [`Packet`]: crate::protocol::Packet

mod decode;
mod encode;
mod frame;


pub use decode::PacketDecoder;
pub use encode::PacketEncoder;
pub use frame::{Frame, FrameReader};

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError, FrameError};

/// Largest value the four-byte remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Incremental remaining-length decoder, fed one byte at a time
#[derive(Debug, Default)]
pub struct RemainingLength {
    value: u32,
    shift: u32,
    count: usize,
}

impl RemainingLength {
    /// Feed the next byte. Returns the value once a byte without the
    /// continuation bit arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<u32>, FrameError> {
        if self.count == 4 {
            return Err(FrameError::MalformedLength);
        }
        self.value |= u32::from(byte & 0x7F) << self.shift;
        self.shift += 7;
        self.count += 1;
        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else if self.count == 4 {
            Err(FrameError::MalformedLength)
        } else {
            Ok(None)
        }
    }
}

/// Decode a remaining length from the start of `buf`.
///
/// Returns `(value, bytes_used)`, or `None` when `buf` ends before the
/// final length byte.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(u32, usize)>, FrameError> {
    let mut acc = RemainingLength::default();
    for (i, &byte) in buf.iter().enumerate() {
        if let Some(value) = acc.push(byte)? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Append the base-128 encoding of `value`. Returns the bytes written.
pub fn encode_remaining_length(value: u32, buf: &mut BytesMut) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut rest = value;
    let mut written = 0;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if rest == 0 {
            return Ok(written);
        }
    }
}

/// Number of bytes `encode_remaining_length` uses for `value`
#[inline]
pub fn remaining_length_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Decode a length-prefixed UTF-8 string from the start of `buf`.
/// Returns the string and the bytes consumed.
pub fn decode_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let mut reader = Reader::new(buf);
    let s = reader.string()?;
    Ok((s, reader.position()))
}

pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Bounds-checked cursor over a packet body
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn varint(&mut self) -> Result<u32, DecodeError> {
        let mut acc = RemainingLength::default();
        loop {
            let byte = self.u8()?;
            match acc.push(byte) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(_) => return Err(DecodeError::Malformed("variable byte integer too long")),
            }
        }
    }

    pub fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<&'a str, DecodeError> {
        let raw = self.binary()?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::InvalidUtf8);
        }
        Ok(s)
    }

    /// Fail if any bytes are left; used after the last field of a packet
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
