//! Minimal protobuf wire codec for the envelope and websocket frames.
//!
//! Only the wire types the frames use are written (varint and
//! length-delimited). The reader skips fields it does not know, including
//! fixed32/fixed64 ones, so newer senders stay readable.

use bytes::{Buf, BufMut};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,
    #[error("varint longer than 10 bytes")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    InvalidWireType(u8),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("unknown envelope type {0}")]
    UnknownEnvelopeType(u64),
    #[error("websocket frame is not a request")]
    NotARequest,
    #[error("field {0} out of range")]
    OutOfRange(&'static str),
}

// ============================================================================
// Writing
// ============================================================================

pub(crate) fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn put_key(buf: &mut impl BufMut, field: u32, wire: u8) {
    put_varint(buf, ((field as u64) << 3) | wire as u64);
}

pub(crate) fn put_uint(buf: &mut impl BufMut, field: u32, value: u64) {
    put_key(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

pub(crate) fn put_bytes(buf: &mut impl BufMut, field: u32, value: &[u8]) {
    put_key(buf, field, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

// ============================================================================
// Reading
// ============================================================================

/// A decoded field value. Fixed-width values are skipped by the reader.
#[derive(Debug)]
pub(crate) enum Value<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Iterates the top-level fields of one message.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        for i in 0..10 {
            if !self.buf.has_remaining() {
                return Err(DecodeError::Truncated);
            }
            let byte = self.buf.get_u8();
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        self.buf.advance(n);
        Ok(())
    }

    /// Next `(field number, value)` pair, or `None` at end of input.
    pub(crate) fn next_field(&mut self) -> Result<Option<(u32, Value<'a>)>, DecodeError> {
        loop {
            if !self.buf.has_remaining() {
                return Ok(None);
            }
            let key = self.varint()?;
            let field = (key >> 3) as u32;
            let wire = (key & 0x7) as u8;
            match wire {
                WIRE_VARINT => return Ok(Some((field, Value::Varint(self.varint()?)))),
                WIRE_LEN => {
                    let len = self.varint()? as usize;
                    if self.buf.remaining() < len {
                        return Err(DecodeError::Truncated);
                    }
                    let (value, rest) = self.buf.split_at(len);
                    self.buf = rest;
                    return Ok(Some((field, Value::Bytes(value))));
                }
                WIRE_FIXED64 => self.skip(8)?,
                WIRE_FIXED32 => self.skip(4)?,
                other => return Err(DecodeError::InvalidWireType(other)),
            }
        }
    }
}
