//! AMF0 encoder and decoder
//!
//! Only the value types that NetConnection/NetStream commands and
//! `onMetaData` actually carry are supported:
//!
//! ```text
//! 0x00 Number       0x05 Null          0x0A Strict Array
//! 0x01 Boolean      0x06 Undefined     0x0B Date
//! 0x02 String       0x07 Reference     0x0C Long String
//! 0x03 Object       0x08 ECMA Array    0x0D Unsupported
//!                   0x09 Object End
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfObject, AmfValue};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;

const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
///
/// Keeps the reference table for the lifetime of one message; create a new
/// decoder (or call [`Amf0Decoder::reset`]) per message.
#[derive(Debug, Default)]
pub struct Amf0Decoder {
    references: Vec<AmfValue>,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.references.clear();
        self.depth = 0;
    }

    /// Decode one value from the front of `buf`
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if !buf.has_remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let value = self.decode_marker(marker, buf);
        self.depth -= 1;
        value
    }

    /// Decode values until `buf` is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_marker(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                ensure(buf, 8)?;
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_string(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_long_string(buf)?)),
            MARKER_OBJECT => {
                let slot = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.fill_reference(slot, AmfValue::Object(props)))
            }
            MARKER_ECMA_ARRAY => {
                // The count is only a hint; properties run until the end marker
                ensure(buf, 4)?;
                let _count = buf.get_u32();
                let slot = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.fill_reference(slot, AmfValue::EcmaArray(props)))
            }
            MARKER_STRICT_ARRAY => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let slot = self.reserve_reference();
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode(buf)?);
                }
                Ok(self.fill_reference(slot, AmfValue::StrictArray(items)))
            }
            MARKER_DATE => {
                ensure(buf, 10)?;
                let millis = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(millis))
            }
            MARKER_REFERENCE => {
                ensure(buf, 2)?;
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<AmfObject, AmfError> {
        let mut props = AmfObject::new();
        loop {
            let key = read_string(buf)?;
            if key.is_empty() {
                // Some encoders end the payload without the 0x09 marker
                if buf.has_remaining() && buf[0] == MARKER_OBJECT_END {
                    buf.advance(1);
                }
                return Ok(props);
            }
            let value = self.decode(buf)?;
            props.insert(key, value);
        }
    }

    fn reserve_reference(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }

    fn fill_reference(&mut self, slot: usize, value: AmfValue) -> AmfValue {
        self.references[slot] = value.clone();
        value
    }
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), AmfError> {
    if buf.remaining() < len {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_string(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    read_utf8(buf, len)
}

fn read_long_string(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    read_utf8(buf, len)
}

fn read_utf8(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
#[derive(Debug)]
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(*b as u8);
            }
            AmfValue::String(s) if s.len() > u16::MAX as usize => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::String(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_key(s);
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::StrictArray(items) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(items.len() as u32);
                for item in items {
                    self.encode(item);
                }
            }
            AmfValue::Date(millis) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(0);
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &AmfObject) {
        for (key, value) in props {
            self.write_key(key);
            self.encode(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// 16-bit length prefixed UTF-8, truncated at a char boundary if too long
    fn write_key(&mut self, s: &str) {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a sequence of values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode every value in `data`
pub fn decode_all(data: Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = data;
    Amf0Decoder::new().decode_all(&mut buf)
}
